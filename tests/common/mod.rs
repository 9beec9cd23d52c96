//! Shared fixtures: a throwaway PKI, an mTLS-requiring upstream and
//! instrumented credential providers.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::sign::{Signer, SigningKey};
use rustls::{RootCertStore, ServerConfig, SignatureAlgorithm, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use kms_proxy::credential::{
    CertificateChain, CredentialError, CredentialProvider, CredentialReference,
};
use kms_proxy::listener::{ListenAddr, ListenSpec, Listener};
use kms_proxy::proxy::{ProxyCore, ProxyServer, ProxyTarget};
use kms_proxy::tls::{ServerVerification, TrustRootSet, build_client_config, crypto_provider};

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate with its private key.
pub struct Leaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: CertificateDer<'static>,
}

impl Leaf {
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes()).unwrap()
    }
}

/// Self-signed CA that issues server and client leaves.
pub struct TestCa {
    pub cert_pem: String,
    pub der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();

        Self {
            cert_pem: cert.pem(),
            der: cert.der().clone(),
            issuer: Issuer::new(params, key),
        }
    }

    /// Server leaf valid for `localhost` and 127.0.0.1.
    pub fn server_leaf(&self) -> Leaf {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params, "upstream")
    }

    /// Client leaf with the given CN.
    pub fn client_leaf(&self, common_name: &str) -> Leaf {
        let mut params = CertificateParams::default();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params, common_name)
    }

    fn issue(&self, mut params: CertificateParams, common_name: &str) -> Leaf {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Leaf {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            der: cert.der().clone(),
        }
    }

    pub fn trust(&self) -> TrustRootSet {
        TrustRootSet::from_certificates(vec![self.der.clone()]).unwrap()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential providers
// ─────────────────────────────────────────────────────────────────────────────

/// Serves a fixed credential and counts every call.
#[derive(Debug)]
pub struct CountingProvider {
    chain: Vec<CertificateDer<'static>>,
    key_pem: String,
    pub chain_calls: AtomicUsize,
    pub signer_calls: AtomicUsize,
    failing: AtomicBool,
    signing_fails: AtomicBool,
}

impl CountingProvider {
    pub fn new(leaf: &Leaf) -> Arc<Self> {
        Arc::new(Self {
            chain: vec![leaf.der.clone()],
            key_pem: leaf.key_pem.clone(),
            chain_calls: AtomicUsize::new(0),
            signer_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            signing_fails: AtomicBool::new(false),
        })
    }

    /// Make every following call fail as if the device were unplugged.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hand out keys whose signatures fail, as if the token were pulled
    /// between the lookup and the signature.
    pub fn set_signing_fails(&self, fails: bool) {
        self.signing_fails.store(fails, Ordering::SeqCst);
    }

    pub fn calls(&self) -> (usize, usize) {
        (
            self.chain_calls.load(Ordering::SeqCst),
            self.signer_calls.load(Ordering::SeqCst),
        )
    }

    fn check(&self, reference: &CredentialReference) -> Result<(), CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::unavailable(reference, "token removed"));
        }
        Ok(())
    }
}

impl CredentialProvider for CountingProvider {
    fn resolve_certificate_chain(
        &self,
        reference: &CredentialReference,
    ) -> Result<CertificateChain, CredentialError> {
        self.chain_calls.fetch_add(1, Ordering::SeqCst);
        self.check(reference)?;
        Ok(CertificateChain::new(self.chain.clone()))
    }

    fn create_signer(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn SigningKey>, CredentialError> {
        self.signer_calls.fetch_add(1, Ordering::SeqCst);
        self.check(reference)?;
        let key = PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|e| CredentialError::unavailable(reference, e))?;
        let key = crypto_provider()
            .key_provider
            .load_private_key(key)
            .map_err(|e| CredentialError::unavailable(reference, e))?;
        if self.signing_fails.load(Ordering::SeqCst) {
            return Ok(Arc::new(PulledKey(key)));
        }
        Ok(key)
    }
}

/// A key whose token is gone by the time it is asked to sign.
#[derive(Debug)]
struct PulledKey(Arc<dyn SigningKey>);

impl SigningKey for PulledKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        self.0
            .choose_scheme(offered)
            .map(|signer| Box::new(PulledSigner(signer.scheme())) as Box<dyn Signer>)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.0.algorithm()
    }
}

#[derive(Debug)]
struct PulledSigner(SignatureScheme);

impl Signer for PulledSigner {
    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        Err(rustls::Error::General("token not present".into()))
    }

    fn scheme(&self) -> SignatureScheme {
        self.0
    }
}

/// A provider that, like a single hardware token, serves one caller at a
/// time and takes a while to answer.
#[derive(Debug)]
pub struct LockedProvider {
    inner: Arc<CountingProvider>,
    device: Mutex<()>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl LockedProvider {
    pub fn new(leaf: &Leaf) -> Arc<Self> {
        Arc::new(Self {
            inner: CountingProvider::new(leaf),
            device: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> (usize, usize) {
        self.inner.calls()
    }

    fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.device.lock().unwrap();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        let result = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl CredentialProvider for LockedProvider {
    fn resolve_certificate_chain(
        &self,
        reference: &CredentialReference,
    ) -> Result<CertificateChain, CredentialError> {
        self.exclusive(|| self.inner.resolve_certificate_chain(reference))
    }

    fn create_signer(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn SigningKey>, CredentialError> {
        self.exclusive(|| self.inner.create_signer(reference))
    }
}

/// A provider whose certificate lookup never comes back in time, like a
/// smartcard reader that stopped answering.
#[derive(Debug)]
pub struct HangingProvider {
    inner: Arc<CountingProvider>,
    hang: Duration,
    entered: AtomicBool,
}

impl HangingProvider {
    pub fn new(leaf: &Leaf, hang: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: CountingProvider::new(leaf),
            hang,
            entered: AtomicBool::new(false),
        })
    }

    /// Whether a lookup is (or was) stuck inside the provider.
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for HangingProvider {
    fn resolve_certificate_chain(
        &self,
        reference: &CredentialReference,
    ) -> Result<CertificateChain, CredentialError> {
        self.entered.store(true, Ordering::SeqCst);
        std::thread::sleep(self.hang);
        self.inner.resolve_certificate_chain(reference)
    }

    fn create_signer(
        &self,
        reference: &CredentialReference,
    ) -> Result<Arc<dyn SigningKey>, CredentialError> {
        self.inner.create_signer(reference)
    }
}

pub fn reference() -> CredentialReference {
    CredentialReference::parse("testkms:name=client").unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream
// ─────────────────────────────────────────────────────────────────────────────

/// An upstream that requires client certificates from `client_ca` and
/// echoes what it received.
pub struct Upstream {
    pub addr: SocketAddr,
    pub handshakes: Arc<AtomicUsize>,
    pub rejected_handshakes: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn https_url(&self) -> String {
        format!("https://127.0.0.1:{}", self.addr.port())
    }

    pub fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }
}

/// Start an mTLS upstream presenting `server` and trusting `client_ca`.
pub async fn spawn_mtls_upstream(server: &Leaf, client_ca: &TestCa) -> Upstream {
    let mut roots = RootCertStore::empty();
    roots.add(client_ca.der.clone()).unwrap();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
        .build()
        .unwrap();
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![server.der.clone()], server.key_der())
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let rejected_handshakes = Arc::new(AtomicUsize::new(0));

    let (ok, rejected) = (Arc::clone(&handshakes), Arc::clone(&rejected_handshakes));
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let (ok, rejected) = (Arc::clone(&ok), Arc::clone(&rejected));
            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(tls) => {
                        ok.fetch_add(1, Ordering::SeqCst);
                        let client_cn = tls
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(|der| {
                                kms_proxy::tls::CertIdentity::from_der(der)
                                    .unwrap()
                                    .display_name
                            });
                        serve_echo(TokioIo::new(tls), client_cn).await;
                    }
                    Err(_) => {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    Upstream {
        addr,
        handshakes,
        rejected_handshakes,
    }
}

/// Start a plaintext upstream.
pub async fn spawn_plain_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_echo(TokioIo::new(tcp), None));
        }
    });
    Upstream {
        addr,
        handshakes: Arc::new(AtomicUsize::new(0)),
        rejected_handshakes: Arc::new(AtomicUsize::new(0)),
    }
}

const REPORTED_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "x-session",
    "upgrade",
];

async fn serve_echo<I>(io: I, client_cn: Option<String>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let client_cn = client_cn.clone();
        async move { Ok::<_, Infallible>(echo(request, client_cn).await) }
    });
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await;
}

/// Echo the body; report the request target, selected headers and the
/// client certificate as `x-seen-*` response headers. Upgrade requests are
/// answered with 101 and an echoing byte stream.
async fn echo(mut request: Request<Incoming>, client_cn: Option<String>) -> Response<Full<Bytes>> {
    let mut response = Response::builder()
        .header("x-seen-uri", request.uri().to_string())
        .header("x-seen-client", client_cn.unwrap_or_else(|| "<none>".into()))
        .header("keep-alive", "timeout=5")
        .header("x-hop", "1")
        .header(CONNECTION, "x-hop");
    for name in REPORTED_HEADERS {
        if let Some(value) = request.headers().get(*name) {
            response = response.header(format!("x-seen-{name}"), value.clone());
        }
    }

    if request.headers().get(UPGRADE).is_some() {
        let on_upgrade = hyper::upgrade::on(&mut request);
        tokio::spawn(async move {
            if let Ok(upgraded) = on_upgrade.await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 1024];
                while let Ok(n) = io.read(&mut buf).await {
                    if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });
        return response
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "echo")
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    let body = request.into_body().collect().await.unwrap().to_bytes();
    response.body(Full::new(body)).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

/// A proxy instance serving in the background.
pub struct RunningProxy {
    pub addr: ListenAddr,
    shutdown: CancellationToken,
}

impl RunningProxy {
    pub fn tcp_addr(&self) -> SocketAddr {
        match &self.addr {
            ListenAddr::Tcp(addr) => *addr,
            ListenAddr::Unix(_) => panic!("proxy is not on TCP"),
        }
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_proxy(
    target: &str,
    verification: ServerVerification,
    provider: Arc<dyn CredentialProvider>,
) -> RunningProxy {
    let listener = ListenSpec::Tcp {
        host: "127.0.0.1".into(),
        port: 0,
    }
    .bind()
    .await
    .unwrap();
    spawn_proxy_on(listener, target, verification, provider, None)
}

pub fn spawn_proxy_on(
    listener: Listener,
    target: &str,
    verification: ServerVerification,
    provider: Arc<dyn CredentialProvider>,
    inbound_tls: Option<TlsAcceptor>,
) -> RunningProxy {
    let core = ProxyCore::new(
        ProxyTarget::parse(target).unwrap(),
        build_client_config(&verification).unwrap(),
        provider,
        reference(),
    );
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(ProxyServer::new(core, inbound_tls).serve(listener, shutdown.clone()));
    RunningProxy { addr, shutdown }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// A fully read response.
pub struct Received {
    pub status: StatusCode,
    pub headers: hyper::HeaderMap,
    pub body: Bytes,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send one request over a fresh connection on `io` and read the response.
pub async fn send_over<I>(io: I, request: Request<Full<Bytes>>) -> Received
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(connection);

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Received {
        status,
        headers,
        body,
    }
}

/// `GET path` through the proxy at `addr`.
pub async fn get(addr: SocketAddr, path: &str) -> Received {
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = Request::get(path)
        .header("host", "proxy.local")
        .body(Full::new(Bytes::new()))
        .unwrap();
    send_over(tcp, request).await
}
