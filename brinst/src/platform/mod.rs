//! Concrete implementations of the engine's platform seams.

pub mod compliance;
pub mod download;
pub mod network;
pub mod oracle_http;
pub mod provision;
pub mod service;

pub use compliance::{SystemFacts, evaluate};
pub use download::{DownloadedPackage, PackageDownloader};
pub use network::HttpNetworkDiagnostics;
pub use oracle_http::HttpSignatureOracle;
pub use service::SystemServiceManager;
