use rand::random_range;
use std::{fs::File, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpListener, select, sync::RwLock};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        crypto::{self, CryptoProvider},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::smtp::{
    SmtpBackend, SmtpConfig,
    connection::{self, ConnectionError},
};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(#[from] rcgen::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    backend: Arc<SmtpBackend>,
    config: Arc<SmtpConfig>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        backend: Arc<SmtpBackend>,
        config: Arc<SmtpConfig>,
        shutdown: CancellationToken,
    ) -> SmtpServer {
        SmtpServer {
            backend,
            config,
            shutdown,
        }
    }

    fn load_tls_files(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file)
        else {
            return self.self_signed();
        };

        let mut cert_reader =
            io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
        let mut key_reader =
            io::BufReader::new(File::open(key_file).map_err(SmtpServerError::PrivateKey)?);

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok((certs, key))
    }

    fn self_signed(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        warn!("no TLS certificate configured, generating a self-signed one");

        let certified = rcgen::generate_simple_self_signed(vec![self.config.server_name.clone()])?;
        let cert = certified.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        Ok((vec![cert], key.into()))
    }

    fn build_tls_acceptor(&self) -> Result<TlsAcceptor, SmtpServerError> {
        let (certs, key) = self.load_tls_files()?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        if CryptoProvider::get_default().is_none() {
            crypto::aws_lc_rs::default_provider().install_default().ok();
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = Arc::new(RwLock::new(self.build_tls_acceptor()?));

        info!("smtp server on {}", self.config.listen_addr);

        // reload file-based certificates roughly daily, with jitter so
        // replicas do not reload at once
        if self.config.cert_file.is_some() {
            let certificate_reload_interval =
                Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
            debug!(
                "automatically reloading the SMTP certificate every {:?}",
                certificate_reload_interval
            );

            let acceptor = acceptor.clone();
            let server = SmtpServer {
                backend: self.backend.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(certificate_reload_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    info!("reloading the SMTP TLS certificate");
                    match server.build_tls_acceptor() {
                        Ok(reloaded) => *acceptor.write().await = reloaded,
                        Err(e) => error!("failed to reload TLS certificate: {e}"),
                    }
                }
            });
        }

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");

                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let acceptor = acceptor.clone();
                        let backend = self.backend.clone();
                        let config = self.config.clone();

                        let Some(guard) = backend.try_acquire() else {
                            debug!(
                                active = backend.active_connections(),
                                "rejecting connection above limit"
                            );
                            tokio::spawn(async move {
                                // complete the handshake so the refusal is
                                // readable by the client
                                if let Ok(mut tls_stream) =
                                    acceptor.read().await.accept(stream).await
                                {
                                    connection::write_reply(
                                        421,
                                        "4.7.0 Too many connections",
                                        &mut tls_stream,
                                        config.write_timeout,
                                    )
                                    .await
                                    .ok();
                                    tls_stream.shutdown().await.ok();
                                }
                            });
                            continue;
                        };

                        let task = async move {
                            let _guard = guard;

                            let mut tls_stream = acceptor.read().await
                                .accept(stream)
                                .await
                                .map_err(ConnectionError::Accept)?;

                            connection::handle(
                                &mut tls_stream,
                                &config.server_name,
                                peer_addr,
                                backend,
                                &config,
                            )
                            .await?;

                            tls_stream.shutdown().await.map_err(ConnectionError::Write)
                        };

                        tokio::spawn(async {
                            if let Err(err) = task.await {
                                let error_string = err.to_string();
                                if let ConnectionError::Accept(e) = err
                                    && (e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::ConnectionReset) {
                                        trace!("failed to handle connection: {error_string}");
                                        return
                                    }
                                error!("failed to handle connection: {error_string}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                },
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        })
    }
}
