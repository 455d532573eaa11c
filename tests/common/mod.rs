// tests/common/mod.rs
// Shared helpers: throwaway PKI, recording handler factory and wait utilities.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentlink::config::ReactorSettings;
use agentlink::security::{CertificateProvider, KeystoreProvider};
use agentlink::{HandlerFactory, Task, TaskHandler, TaskType};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const WAIT: Duration = Duration::from_secs(10);

/// Reactor settings tuned for tests: small pools, short handshake budget.
pub fn settings() -> ReactorSettings {
    ReactorSettings::default()
        .with_workers(2)
        .with_handshake_timeout(Duration::from_secs(5))
}

pub fn permissive_provider() -> Arc<dyn CertificateProvider> {
    Arc::new(KeystoreProvider::ephemeral(&["localhost"], Vec::new()).expect("ephemeral identity"))
}

/// Scratch directory below the system temp dir, emptied on creation.
pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("agentlink-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

pub struct Issued {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

/// A throwaway certificate authority.
pub struct Pki {
    ca: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    pub fn new(cn: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, cn);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().expect("ca key");
        let ca = params.self_signed(&ca_key).expect("ca cert");
        Self { ca, ca_key }
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca.der().clone()
    }

    pub fn ca_pem(&self) -> String {
        self.ca.pem()
    }

    pub fn issue(&self, names: &[&str]) -> Issued {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names).expect("leaf params");
        params.distinguished_name.push(DnType::CommonName, "agentlink test");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().expect("leaf key");
        let cert = params
            .signed_by(&key, &self.ca, &self.ca_key)
            .expect("sign leaf");
        Issued {
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// Provider presenting a fresh leaf of this CA and trusting `trusted`.
    pub fn provider(&self, trusted: Vec<CertificateDer<'static>>) -> Arc<dyn CertificateProvider> {
        let issued = self.issue(&["localhost"]);
        Arc::new(KeystoreProvider::from_parts(issued.chain, issued.key, trusted).expect("provider"))
    }
}

type Behaviour = dyn Fn(Task) -> anyhow::Result<()> + Send + Sync;

/// Records every task in dispatch order, then runs an optional behaviour on
/// the worker.
pub struct Recorder {
    tx: Mutex<Sender<Task>>,
    behaviour: Option<Arc<Behaviour>>,
}

struct Run {
    behaviour: Option<Arc<Behaviour>>,
    task: Task,
}

impl TaskHandler for Run {
    fn run(self: Box<Self>) -> anyhow::Result<()> {
        match self.behaviour {
            Some(b) => b(self.task),
            None => Ok(()),
        }
    }
}

impl HandlerFactory for Recorder {
    fn create(&self, task: Task) -> Box<dyn TaskHandler> {
        let _ = self.tx.lock().send(task.clone());
        Box::new(Run {
            behaviour: self.behaviour.clone(),
            task,
        })
    }
}

pub fn recorder() -> (Arc<dyn HandlerFactory>, Receiver<Task>) {
    let (tx, rx) = mpsc::channel();
    let factory: Arc<dyn HandlerFactory> = Arc::new(Recorder {
        tx: Mutex::new(tx),
        behaviour: None,
    });
    (factory, rx)
}

pub fn recorder_with<F>(f: F) -> (Arc<dyn HandlerFactory>, Receiver<Task>)
where
    F: Fn(Task) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    let factory: Arc<dyn HandlerFactory> = Arc::new(Recorder {
        tx: Mutex::new(tx),
        behaviour: Some(Arc::new(f)),
    });
    (factory, rx)
}

/// Next task of `kind`, skipping others.
pub fn next_of(rx: &Receiver<Task>, kind: TaskType, timeout: Duration) -> Option<Task> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(left) {
            Ok(task) if task.kind() == kind => return Some(task),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Payloads of the next `n` Data tasks, in dispatch order.
pub fn data_payloads(rx: &Receiver<Task>, n: usize, timeout: Duration) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while out.len() < n {
        match next_of(rx, TaskType::Data, timeout) {
            Some(task) => out.push(task.into_payload().unwrap_or_default()),
            None => break,
        }
    }
    out
}

/// Every task until (and including) the first of `kind`.
pub fn tasks_until(rx: &Receiver<Task>, kind: TaskType, timeout: Duration) -> Vec<Task> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(task) => {
                let done = task.kind() == kind;
                out.push(task);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    out
}

pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
