//! In-memory stand-ins for the platform seams.

use crate::errors::InstallError;
use crate::platform::{NetworkDiagnostics, ServiceError, ServiceManager, ServiceSpec, ServiceState};
use crate::signature::oracle::{
    NonceCheckRequest, NonceCheckResponse, OracleError, SignatureOracle, VerifyRequest,
    VerifyResponse,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted oracle. Unscripted calls answer "valid" and "nonce unused".
#[derive(Default)]
pub struct MockOracle {
    verify_script: Mutex<VecDeque<Result<VerifyResponse, OracleError>>>,
    nonce_script: Mutex<VecDeque<Result<NonceCheckResponse, OracleError>>>,
    verify_calls: Mutex<Vec<VerifyRequest>>,
    nonce_calls: Mutex<Vec<NonceCheckRequest>>,
    verify_delay: Mutex<Option<Duration>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_verify(&self, response: Result<VerifyResponse, OracleError>) {
        lock(&self.verify_script).push_back(response);
    }

    pub fn push_nonce(&self, response: Result<NonceCheckResponse, OracleError>) {
        lock(&self.nonce_script).push_back(response);
    }

    /// Delay every verify call, e.g. to trip the caller's timeout.
    pub fn delay_verify(&self, delay: Duration) {
        *lock(&self.verify_delay) = Some(delay);
    }

    pub fn verify_calls(&self) -> Vec<VerifyRequest> {
        lock(&self.verify_calls).clone()
    }

    pub fn nonce_calls(&self) -> Vec<NonceCheckRequest> {
        lock(&self.nonce_calls).clone()
    }
}

#[async_trait]
impl SignatureOracle for MockOracle {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, OracleError> {
        lock(&self.verify_calls).push(request.clone());
        let delay = *lock(&self.verify_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.verify_script).pop_front().unwrap_or(Ok(VerifyResponse {
            is_valid: true,
            error_message: None,
        }))
    }

    async fn check_nonce(
        &self,
        request: &NonceCheckRequest,
    ) -> Result<NonceCheckResponse, OracleError> {
        lock(&self.nonce_calls).push(request.clone());
        lock(&self.nonce_script)
            .pop_front()
            .unwrap_or(Ok(NonceCheckResponse { is_used: false }))
    }
}

#[derive(Default)]
struct ServiceTable {
    services: HashMap<String, ServiceState>,
    specs: Vec<ServiceSpec>,
    calls: Vec<String>,
    fail_create: Option<String>,
    fail_start: Option<String>,
    fail_delete: Option<String>,
    running_processes: HashMap<PathBuf, usize>,
}

/// Service manager backed by a map of name to state.
#[derive(Default)]
pub struct MockServiceManager {
    table: Mutex<ServiceTable>,
}

impl MockServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service as if a previous install had left it behind.
    pub fn install_existing(&self, name: &str) {
        lock(&self.table)
            .services
            .insert(name.to_string(), ServiceState::Running);
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.table).services.contains_key(name)
    }

    pub fn state(&self, name: &str) -> ServiceState {
        lock(&self.table)
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceState::NotInstalled)
    }

    pub fn fail_create(&self, message: &str) {
        lock(&self.table).fail_create = Some(message.to_string());
    }

    pub fn fail_start(&self, message: &str) {
        lock(&self.table).fail_start = Some(message.to_string());
    }

    pub fn fail_delete(&self, message: &str) {
        lock(&self.table).fail_delete = Some(message.to_string());
    }

    /// Pretend `count` processes are running `binary`.
    pub fn spawn_processes(&self, binary: &Path, count: usize) {
        lock(&self.table)
            .running_processes
            .insert(binary.to_path_buf(), count);
    }

    /// Every call made, as "operation name".
    pub fn calls(&self) -> Vec<String> {
        lock(&self.table).calls.clone()
    }

    pub fn created_specs(&self) -> Vec<ServiceSpec> {
        lock(&self.table).specs.clone()
    }
}

fn scripted_failure(command: String, message: &str) -> ServiceError {
    ServiceError::CommandFailed {
        command,
        code: Some(1),
        stderr: message.to_string(),
    }
}

#[async_trait]
impl ServiceManager for MockServiceManager {
    async fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        let mut table = lock(&self.table);
        table.calls.push(format!("create {}", spec.name));
        if let Some(message) = &table.fail_create {
            return Err(scripted_failure(format!("create {}", spec.name), message));
        }
        if table.services.contains_key(&spec.name) {
            return Err(scripted_failure(
                format!("create {}", spec.name),
                "service already exists",
            ));
        }
        table.services.insert(spec.name.clone(), ServiceState::Stopped);
        table.specs.push(spec.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        let mut table = lock(&self.table);
        table.calls.push(format!("start {name}"));
        if let Some(message) = &table.fail_start {
            return Err(scripted_failure(format!("start {name}"), message));
        }
        match table.services.get_mut(name) {
            Some(state) => {
                *state = ServiceState::Running;
                Ok(())
            }
            None => Err(ServiceError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), ServiceError> {
        let mut table = lock(&self.table);
        table.calls.push(format!("stop {name}"));
        match table.services.get_mut(name) {
            Some(state) => {
                *state = ServiceState::Stopped;
                Ok(())
            }
            None => Err(ServiceError::NotFound(name.to_string())),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let mut table = lock(&self.table);
        table.calls.push(format!("delete {name}"));
        if let Some(message) = &table.fail_delete {
            return Err(scripted_failure(format!("delete {name}"), message));
        }
        match table.services.remove(name) {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound(name.to_string())),
        }
    }

    async fn status(&self, name: &str) -> Result<ServiceState, ServiceError> {
        let mut table = lock(&self.table);
        table.calls.push(format!("status {name}"));
        Ok(table
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceState::NotInstalled))
    }

    async fn kill_processes(&self, binary_path: &Path) -> Result<usize, ServiceError> {
        let mut table = lock(&self.table);
        table
            .calls
            .push(format!("kill {}", binary_path.display()));
        Ok(table.running_processes.remove(binary_path).unwrap_or(0))
    }
}

#[derive(Default)]
struct NetworkTable {
    unreachable: HashSet<String>,
    probed: Vec<String>,
    fail_dns_flush: bool,
    dns_flushes: usize,
}

/// Every URL is reachable unless marked otherwise.
#[derive(Default)]
pub struct MockNetworkDiagnostics {
    table: Mutex<NetworkTable>,
}

impl MockNetworkDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, url: &str) {
        lock(&self.table).unreachable.insert(url.to_string());
    }

    pub fn set_reachable(&self, url: &str) {
        lock(&self.table).unreachable.remove(url);
    }

    pub fn fail_dns_flush(&self, fail: bool) {
        lock(&self.table).fail_dns_flush = fail;
    }

    pub fn probed(&self) -> Vec<String> {
        lock(&self.table).probed.clone()
    }

    pub fn dns_flushes(&self) -> usize {
        lock(&self.table).dns_flushes
    }
}

#[async_trait]
impl NetworkDiagnostics for MockNetworkDiagnostics {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<(), InstallError> {
        let mut table = lock(&self.table);
        table.probed.push(url.to_string());
        if table.unreachable.contains(url) {
            return Err(InstallError::Network(format!("{url} is unreachable")));
        }
        Ok(())
    }

    async fn flush_dns_cache(&self) -> Result<(), InstallError> {
        let mut table = lock(&self.table);
        table.dns_flushes += 1;
        if table.fail_dns_flush {
            return Err(InstallError::Network("DNS cache flush failed".to_string()));
        }
        Ok(())
    }
}
