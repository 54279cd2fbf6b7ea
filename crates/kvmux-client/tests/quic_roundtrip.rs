// End-to-end: submits batched over a real QUIC connection against an
// in-process peer that speaks the kvmux batch protocol.
use anyhow::{Context, Result};
use bytes::Bytes;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use kvmux_client::{BatchConfig, BatchConn, SubmitRequest};
use kvmux_transport::{QuicTransport, Transport, TransportConfig, read_frame, read_hello};
use kvmux_wire::{BatchRequest, BatchResponse};

const MAX_FRAME: usize = 4 * 1024 * 1024;

fn make_server_config() -> Result<(quinn::ServerConfig, CertificateDer<'static>)> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .context("generate self-signed cert")?;
    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
    let server_config =
        quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())
            .context("build server config")?;
    Ok((server_config, cert_der))
}

fn make_client_config(cert: CertificateDer<'static>) -> Result<quinn::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(cert).context("add root cert")?;
    Ok(quinn::ClientConfig::with_root_certificates(Arc::new(roots))?)
}

/// Echo peer: answers every request batch on every stream, prefixing
/// forwarded payloads with the forwarding target so tests can tell the
/// streams apart.
fn spawn_echo_peer(endpoint: quinn::Endpoint) {
    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let Ok(connection) = incoming.await else {
                continue;
            };
            tokio::spawn(async move {
                while let Ok((mut send, mut recv)) = connection.accept_bi().await {
                    tokio::spawn(async move {
                        let Ok(hello) = read_hello(&mut recv, MAX_FRAME).await else {
                            return;
                        };
                        while let Ok(Some(frame)) = read_frame(&mut recv, MAX_FRAME).await {
                            let Ok(batch) = BatchRequest::decode(&frame) else {
                                return;
                            };
                            let responses = batch
                                .requests
                                .iter()
                                .map(|payload| match &hello.forwarded_host {
                                    Some(host) => {
                                        let mut tagged = Vec::with_capacity(host.len() + 1 + payload.len());
                                        tagged.extend_from_slice(host.as_bytes());
                                        tagged.push(b'/');
                                        tagged.extend_from_slice(payload);
                                        Bytes::from(tagged)
                                    }
                                    None => payload.clone(),
                                })
                                .collect();
                            let response = BatchResponse {
                                request_ids: batch.request_ids.clone(),
                                responses,
                                transport_layer_load: 0,
                                health_feedback: None,
                            };
                            if send.write_all(&response.encode_frame()).await.is_err() {
                                return;
                            }
                        }
                    });
                }
            });
        }
    });
}

#[tokio::test]
async fn submits_round_trip_over_quic() -> Result<()> {
    let (server_config, cert) = make_server_config()?;
    let server = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
    let addr = server.local_addr()?;
    spawn_echo_peer(server);

    let transport = QuicTransport::bind(
        "0.0.0.0:0".parse()?,
        make_client_config(cert)?,
        addr,
        "localhost",
        TransportConfig::default(),
    )?;
    let config = BatchConfig {
        batch_policy: "positive".to_string(),
        ..BatchConfig::default()
    };
    let conn = BatchConn::new(
        "localhost",
        vec![Arc::new(transport) as Arc<dyn Transport>],
        config,
        Arc::new(AtomicU32::new(0)),
    );
    BatchConn::spawn_send_loop(&conn);

    let mut submits = Vec::new();
    for index in 0..8u8 {
        let conn = Arc::clone(&conn);
        submits.push(tokio::spawn(async move {
            let payload = Bytes::from(vec![index]);
            let response = conn
                .submit(SubmitRequest::new(payload.clone(), Duration::from_secs(5)))
                .await?;
            Ok::<_, kvmux_client::Error>((payload, response))
        }));
    }
    for submit in submits {
        let (payload, response) = submit.await.context("join")?.context("submit")?;
        assert_eq!(payload, response);
    }

    // Forwarded traffic rides its own stream; the peer tags it so we can see
    // which stream carried it.
    let response = conn
        .submit(SubmitRequest {
            payload: Bytes::from_static(b"hop"),
            forwarded_host: Some("peer-7:20160".to_string()),
            priority: 0,
            timeout: Duration::from_secs(5),
        })
        .await
        .context("forwarded submit")?;
    assert_eq!(response, Bytes::from_static(b"peer-7:20160/hop"));

    conn.close();
    Ok(())
}
