use std::fs;
use std::io::BufReader;
use std::path::Path;

use crate::error::DaemonError;

/// Reads the node's PEM certificate file into DER blocks.
pub fn load_certificates(path: &Path) -> Result<Vec<Vec<u8>>, DaemonError> {
    let pem = fs::read(path)
        .map_err(|err| DaemonError::Tls(format!("failed to read cert {}: {err}", path.display())))?;
    parse_certificates(&pem)
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<Vec<u8>>, DaemonError> {
    let mut reader = BufReader::new(pem);
    let blocks = rustls_pemfile::certs(&mut reader)
        .map_err(|_| DaemonError::Tls("failed to parse cert".to_string()))?;
    if blocks.is_empty() {
        return Err(DaemonError::Tls("failed to parse cert".to_string()));
    }
    Ok(blocks)
}

/// Admin credential for authenticated calls, hex encoded.
pub fn read_macaroon(path: &Path) -> Result<String, DaemonError> {
    let data = fs::read(path).map_err(|err| {
        DaemonError::Credentials(format!("failed to read macaroon {}: {err}", path.display()))
    })?;
    Ok(hex::encode(data))
}
