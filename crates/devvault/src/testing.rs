//! In-memory store and process doubles shared by the unit tests.
//!
//! `FakeStore` and `FakeProcess` share one `FakeVault`, the same way the
//! real client and supervisor share one store process. Starting with a
//! `-dev` launch command brings up a fresh in-memory server; any other
//! command brings up the durable server, whose state survives restarts for
//! as long as its storage directory holds the init marker.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value;

use crate::client::{HealthStatus, InitResponse, SealStatus, SecretDocument, StoreApi, StoreError};
use crate::mode::Mode;
use crate::process::{ProcessError, StopOutcome, StoreProcess};

pub const DEV_TOKEN: &str = "root";
const INIT_MARKER: &str = "fake-initialized";

#[derive(Debug, Default)]
pub struct DurableState {
    pub initialized: bool,
    pub sealed: bool,
    pub keys: Vec<String>,
    pub threshold: u32,
    pub accepted: Vec<String>,
    pub root_token: String,
    pub kv_mounted: bool,
    pub secrets: BTreeMap<String, SecretDocument>,
}

#[derive(Debug, Default)]
pub struct FakeVault {
    /// Which server is up, if any
    pub running: Option<Mode>,
    /// Whether a started server answers HTTP
    pub answers_after_start: bool,
    pub ephemeral: BTreeMap<String, SecretDocument>,
    pub durable: DurableState,
    /// Raft directory; the durable state is wiped if its marker disappears
    pub storage_dir: Option<PathBuf>,
    pub token: Option<String>,
    pub fail_writes: BTreeSet<String>,
    pub fail_start: bool,
    pub starts: u32,
    pub stops: u32,
    pub init_calls: u32,
    pub unseal_calls: u32,
    inits: u32,
}

pub type Shared = Rc<RefCell<FakeVault>>;

impl FakeVault {
    pub fn new() -> Shared {
        Rc::new(RefCell::new(Self {
            answers_after_start: true,
            ..Self::default()
        }))
    }

    /// A running dev server holding `secrets`
    pub fn running_ephemeral(secrets: &[(&str, &str)]) -> Shared {
        let vault = Self::new();
        {
            let mut v = vault.borrow_mut();
            v.running = Some(Mode::Ephemeral);
            for (path, value) in secrets {
                v.ephemeral.insert(path.to_string(), doc(value));
            }
        }
        vault
    }

    fn secrets(&self) -> Result<&BTreeMap<String, SecretDocument>, StoreError> {
        match self.running {
            None => Err(StoreError::Unreachable("connection refused".into())),
            Some(Mode::Ephemeral) => {
                self.authorize(DEV_TOKEN)?;
                Ok(&self.ephemeral)
            }
            Some(Mode::Durable) => {
                if self.durable.sealed {
                    return Err(StoreError::Sealed);
                }
                self.authorize(&self.durable.root_token)?;
                Ok(&self.durable.secrets)
            }
        }
    }

    fn authorize(&self, expected: &str) -> Result<(), StoreError> {
        match self.token.as_deref() {
            Some(t) if t == expected => Ok(()),
            _ => Err(StoreError::PermissionDenied("bad token".into())),
        }
    }

    fn seal(&self) -> SealStatus {
        match self.running {
            Some(Mode::Durable) => SealStatus {
                initialized: self.durable.initialized,
                sealed: self.durable.sealed,
                progress: self.durable.accepted.len() as u32,
                threshold: self.durable.threshold,
                shares: self.durable.keys.len() as u32,
            },
            _ => SealStatus {
                initialized: true,
                sealed: false,
                progress: 0,
                threshold: 1,
                shares: 1,
            },
        }
    }

    fn ensure_up(&self) -> Result<(), StoreError> {
        if self.running.is_some() {
            Ok(())
        } else {
            Err(StoreError::Unreachable("connection refused".into()))
        }
    }

    pub fn durable_secret(&self, path: &str) -> Option<Value> {
        self.durable.secrets.get(path).and_then(|d| d.get("value").cloned())
    }

    pub fn ephemeral_secret(&self, path: &str) -> Option<Value> {
        self.ephemeral.get(path).and_then(|d| d.get("value").cloned())
    }
}

/// `{"value": <value>}`
pub fn doc(value: &str) -> SecretDocument {
    let mut d = SecretDocument::new();
    d.insert("value".to_string(), Value::from(value));
    d
}

pub struct FakeStore(pub Shared);

impl StoreApi for FakeStore {
    fn health(&self) -> Result<HealthStatus, StoreError> {
        let v = self.0.borrow();
        v.ensure_up()?;
        let s = v.seal();
        Ok(HealthStatus {
            initialized: s.initialized,
            sealed: s.sealed,
            version: Some("1.15.0-fake".to_string()),
        })
    }

    fn seal_status(&self) -> Result<SealStatus, StoreError> {
        let v = self.0.borrow();
        v.ensure_up()?;
        Ok(v.seal())
    }

    fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, StoreError> {
        let mut v = self.0.borrow_mut();
        v.ensure_up()?;
        v.init_calls += 1;
        if v.running != Some(Mode::Durable) || v.durable.initialized {
            return Err(StoreError::Api {
                status: 400,
                message: "Vault is already initialized".into(),
            });
        }
        v.inits += 1;
        let generation = v.inits;
        let keys: Vec<String> = (0..shares)
            .map(|i| format!("{:02x}{:02x}-share-material-{}", generation, i, i))
            .collect();
        let root_token = format!("hvs.fake-root-{}", generation);

        v.durable = DurableState {
            initialized: true,
            sealed: true,
            keys: keys.clone(),
            threshold: threshold as u32,
            root_token: root_token.clone(),
            ..DurableState::default()
        };
        if let Some(dir) = v.storage_dir.clone() {
            fs::create_dir_all(&dir).map_err(|e| StoreError::Unreachable(e.to_string()))?;
            fs::write(dir.join(INIT_MARKER), b"1").map_err(|e| StoreError::Unreachable(e.to_string()))?;
        }

        Ok(InitResponse {
            keys_base64: keys.iter().map(|_| "c2hhcmU=".to_string()).collect(),
            keys,
            root_token,
        })
    }

    fn unseal(&self, key: &str) -> Result<SealStatus, StoreError> {
        let mut v = self.0.borrow_mut();
        v.ensure_up()?;
        v.unseal_calls += 1;
        if v.running != Some(Mode::Durable) || !v.durable.sealed {
            return Ok(v.seal());
        }
        if !v.durable.keys.iter().any(|k| k == key) {
            v.durable.accepted.clear();
            return Err(StoreError::Api {
                status: 400,
                message: "invalid key".into(),
            });
        }
        if !v.durable.accepted.iter().any(|k| k == key) {
            v.durable.accepted.push(key.to_string());
        }
        if v.durable.accepted.len() as u32 >= v.durable.threshold {
            v.durable.sealed = false;
            v.durable.accepted.clear();
        }
        Ok(v.seal())
    }

    fn list_secrets(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let v = self.0.borrow();
        let secrets = v.secrets()?;
        let prefix = format!("{}/", prefix.trim_matches('/'));
        let mut children = BTreeSet::new();
        for path in secrets.keys() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((folder, _)) => children.insert(format!("{}/", folder)),
                    None => children.insert(rest.to_string()),
                };
            }
        }
        Ok(children.into_iter().collect())
    }

    fn read_secret(&self, path: &str) -> Result<SecretDocument, StoreError> {
        let v = self.0.borrow();
        v.secrets()?
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn write_secret(&self, path: &str, doc: &SecretDocument) -> Result<(), StoreError> {
        let mut v = self.0.borrow_mut();
        v.secrets()?;
        if v.fail_writes.contains(path) {
            return Err(StoreError::Api {
                status: 500,
                message: "internal error".into(),
            });
        }
        match v.running {
            Some(Mode::Ephemeral) => {
                v.ephemeral.insert(path.to_string(), doc.clone());
            }
            Some(Mode::Durable) => {
                if !v.durable.kv_mounted {
                    return Err(StoreError::Api {
                        status: 404,
                        message: format!("no handler for route 'secret/data/{}'", path),
                    });
                }
                v.durable.secrets.insert(path.to_string(), doc.clone());
            }
            None => unreachable!("secrets() checked the server is up"),
        }
        Ok(())
    }

    fn enable_kv(&self) -> Result<bool, StoreError> {
        let mut v = self.0.borrow_mut();
        v.secrets()?;
        match v.running {
            Some(Mode::Durable) if !v.durable.kv_mounted => {
                v.durable.kv_mounted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_token(&mut self, token: &str) {
        self.0.borrow_mut().token = Some(token.to_string());
    }
}

pub struct FakeProcess(pub Shared);

impl StoreProcess for FakeProcess {
    fn is_running(&self) -> bool {
        self.0.borrow().running.is_some()
    }

    fn start(&mut self, launch_command: &str) -> Result<u32, ProcessError> {
        let mut v = self.0.borrow_mut();
        if v.fail_start {
            return Err(ProcessError::Spawn {
                command: launch_command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "vault: not found"),
            });
        }
        v.starts += 1;

        if launch_command.contains("-dev") {
            v.ephemeral.clear();
            v.running = Some(Mode::Ephemeral);
        } else {
            let wiped = match &v.storage_dir {
                Some(dir) => !dir.join(INIT_MARKER).exists(),
                None => false,
            };
            if wiped {
                v.durable = DurableState::default();
            }
            v.durable.sealed = true;
            v.durable.accepted.clear();
            v.running = Some(Mode::Durable);
        }

        if !v.answers_after_start {
            v.running = None;
        }
        Ok(4242)
    }

    fn stop(&mut self) -> Result<StopOutcome, ProcessError> {
        let mut v = self.0.borrow_mut();
        if v.running.take().is_some() {
            v.stops += 1;
            Ok(StopOutcome::Stopped {
                pid: 4242,
                forced: false,
            })
        } else {
            Ok(StopOutcome::NotRunning)
        }
    }
}

/// Supervisor that never owns the server answering on the address, like a
/// store launched by a container entrypoint instead of devvault.
pub struct ForeignProcess;

impl StoreProcess for ForeignProcess {
    fn is_running(&self) -> bool {
        false
    }

    fn start(&mut self, _launch_command: &str) -> Result<u32, ProcessError> {
        Ok(1)
    }

    fn stop(&mut self) -> Result<StopOutcome, ProcessError> {
        Ok(StopOutcome::NotRunning)
    }
}

/// Always launches a dev server, whatever command it is given
pub struct DevOnlyProcess(pub Shared);

impl StoreProcess for DevOnlyProcess {
    fn is_running(&self) -> bool {
        FakeProcess(self.0.clone()).is_running()
    }

    fn start(&mut self, _launch_command: &str) -> Result<u32, ProcessError> {
        FakeProcess(self.0.clone()).start("vault server -dev")
    }

    fn stop(&mut self) -> Result<StopOutcome, ProcessError> {
        FakeProcess(self.0.clone()).stop()
    }
}
