use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use folio::{
    application::{
        convert::Converter,
        notify::NotificationQueue,
    },
    config::{ConvertSettings, EngineSettings, TlsSettings},
    infra::{
        http::{ClientIpSource, HttpState, build_router},
        notify::LogNotifier,
        server::{Server, ShutdownSignal},
        tls::{TrustPolicy, VerifiedChain, build_server_config, render_subject},
    },
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

struct Issued {
    cert: Certificate,
    key: KeyPair,
}

struct Pki {
    ca: Issued,
}

impl Pki {
    fn new(name: &str) -> Self {
        let key = KeyPair::generate().expect("ca key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).expect("ca cert");
        Self {
            ca: Issued { cert, key },
        }
    }

    fn issue(&self, dn: &[(DnType, &str)], sans: &[&str], usage: ExtendedKeyUsagePurpose) -> Issued {
        let key = KeyPair::generate().expect("leaf key");
        let mut params = CertificateParams::new(
            sans.iter().map(|san| san.to_string()).collect::<Vec<_>>(),
        )
        .expect("leaf params");
        params.distinguished_name = DistinguishedName::new();
        for (kind, value) in dn {
            params.distinguished_name.push(kind.clone(), *value);
        }
        params.extended_key_usages = vec![usage];
        let cert = params
            .signed_by(&key, &self.ca.cert, &self.ca.key)
            .expect("leaf cert");
        Issued { cert, key }
    }

    fn client(&self, common_name: &str) -> Issued {
        self.issue(
            &[(DnType::CommonName, common_name)],
            &[],
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }
}

fn private_key(issued: &Issued) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(issued.key.serialize_der()))
}

fn client_config(server_ca: &Pki, identity: Option<&Issued>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(server_ca.ca.cert.der().clone())
        .expect("trust server ca");
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .expect("tls13")
    .with_root_certificates(roots);

    let config = match identity {
        Some(issued) => builder
            .with_client_auth_cert(vec![issued.cert.der().clone()], private_key(issued))
            .expect("client identity"),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

struct RunningServer {
    addr: SocketAddr,
    stop: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl RunningServer {
    async fn start(server_pki: &Pki, client_roots: Option<&Pki>, subject: Option<&str>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let server = server_pki.issue(
            &[(DnType::CommonName, "localhost")],
            &["localhost"],
            ExtendedKeyUsagePurpose::ServerAuth,
        );

        let cert_file = dir.path().join("server.pem");
        let key_file = dir.path().join("server.key");
        std::fs::write(&cert_file, server.cert.pem()).expect("write cert");
        std::fs::write(&key_file, server.key.serialize_pem()).expect("write key");

        let root_ca = client_roots.map(|pki| {
            let path = dir.path().join("clients-ca.pem");
            std::fs::write(&path, pki.ca.cert.pem()).expect("write client ca");
            path
        });

        let settings = TlsSettings {
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            root_ca,
            cert_subject: subject.map(str::to_string),
        };
        let policy = TrustPolicy::load(settings.root_ca.as_deref(), settings.cert_subject.clone())
            .expect("policy");
        let tls = build_server_config(&settings, Arc::new(policy)).expect("server config");

        let (notifications, _worker) =
            NotificationQueue::spawn(Arc::new(LogNotifier), 4, Duration::from_secs(1));
        let converter = Converter::new(
            EngineSettings {
                path: PathBuf::from("/nonexistent/pandoc"),
                data_dir: PathBuf::from("/.pandoc"),
                command_timeout: Duration::from_secs(1),
                temp_dir: dir.path().to_path_buf(),
            },
            &ConvertSettings {
                max_concurrent: std::num::NonZeroU32::new(1).expect("non-zero"),
                max_resources: std::num::NonZeroU32::new(1).expect("non-zero"),
            },
        );
        let router = build_router(
            HttpState {
                converter: Arc::new(converter),
                notifications,
                client_ip: ClientIpSource::Peer,
            },
            1024,
        );

        let server = Server::bind(
            "127.0.0.1:0".parse().expect("addr"),
            router,
            Some(tls),
            Duration::from_secs(1),
        )
        .await
        .expect("bind");
        let addr = server.local_addr().expect("local addr");

        let (stop, shutdown) = ShutdownSignal::channel();
        let task = tokio::spawn(async move {
            server.run(shutdown).await.expect("server run");
        });

        Self {
            addr,
            stop,
            task,
            _dir: dir,
        }
    }

    /// Status code of `GET /health`, or `None` when the connection was refused
    /// during or right after the handshake.
    async fn health(&self, config: Arc<ClientConfig>) -> Option<u16> {
        let tcp = TcpStream::connect(self.addr).await.ok()?;
        let name = ServerName::try_from("localhost").expect("server name");
        let mut stream = TlsConnector::from(config).connect(name, tcp).await.ok()?;
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .ok()?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.ok()?;
        let text = String::from_utf8_lossy(&response);
        text.lines()
            .next()?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stops")
            .expect("server task");
    }
}

#[tokio::test]
async fn matching_subject_is_admitted() {
    let server_pki = Pki::new("folio server CA");
    let client_pki = Pki::new("folio client CA");
    let server = RunningServer::start(&server_pki, Some(&client_pki), Some("CN=allowed-client")).await;

    let allowed = client_pki.client("allowed-client");
    let status = server
        .health(client_config(&server_pki, Some(&allowed)))
        .await;
    assert_eq!(status, Some(204));

    server.stop().await;
}

#[tokio::test]
async fn other_subject_is_refused() {
    let server_pki = Pki::new("folio server CA");
    let client_pki = Pki::new("folio client CA");
    let server = RunningServer::start(&server_pki, Some(&client_pki), Some("CN=allowed-client")).await;

    let intruder = client_pki.client("someone-else");
    let status = server
        .health(client_config(&server_pki, Some(&intruder)))
        .await;
    assert_eq!(status, None);

    server.stop().await;
}

#[tokio::test]
async fn missing_or_untrusted_certificate_is_refused() {
    let server_pki = Pki::new("folio server CA");
    let client_pki = Pki::new("folio client CA");
    let rogue_pki = Pki::new("rogue CA");
    let server = RunningServer::start(&server_pki, Some(&client_pki), None).await;

    assert_eq!(server.health(client_config(&server_pki, None)).await, None);

    let rogue = rogue_pki.client("allowed-client");
    assert_eq!(
        server
            .health(client_config(&server_pki, Some(&rogue)))
            .await,
        None
    );

    let anyone = client_pki.client("anyone");
    assert_eq!(
        server
            .health(client_config(&server_pki, Some(&anyone)))
            .await,
        Some(204)
    );

    server.stop().await;
}

#[tokio::test]
async fn without_root_bundle_no_certificate_is_needed() {
    let server_pki = Pki::new("folio server CA");
    let server = RunningServer::start(&server_pki, None, Some("CN=ignored")).await;

    assert_eq!(
        server.health(client_config(&server_pki, None)).await,
        Some(204)
    );

    server.stop().await;
}

#[test]
fn subjects_render_in_reverse_order() {
    let pki = Pki::new("folio client CA");
    let issued = pki.issue(
        &[
            (DnType::CountryName, "DE"),
            (DnType::OrganizationName, "Acme, Inc."),
            (DnType::CommonName, "client.example"),
        ],
        &[],
        ExtendedKeyUsagePurpose::ClientAuth,
    );

    let subject = render_subject(issued.cert.der()).expect("subject");
    assert_eq!(subject, "CN=client.example,O=Acme\\, Inc.,C=DE");

    let ca_subject = render_subject(pki.ca.cert.der()).expect("ca subject");
    assert_eq!(ca_subject, "CN=folio client CA");
}

#[test]
fn chain_summary_is_leaf_first() {
    let pki = Pki::new("folio client CA");
    let leaf = pki.client("leaf");
    let certs: Vec<CertificateDer<'static>> =
        vec![leaf.cert.der().clone(), pki.ca.cert.der().clone()];

    let chain = VerifiedChain::from_der(&certs).expect("chain");
    let subjects: Vec<_> = chain
        .certificates()
        .iter()
        .map(|cert| cert.subject.as_str())
        .collect();
    assert_eq!(subjects, vec!["CN=leaf", "CN=folio client CA"]);
    assert!(!chain.leaf().expect("leaf").serial.is_empty());

    let policy = TrustPolicy::new(Some(RootCertStore::empty()), Some("CN=leaf".to_string()));
    assert!(policy.authorize(&[chain]).is_granted());
}
