// src/signature.rs

//! Detached manifest signatures
//!
//! A signed bundle carries `manifest.sha256` right after `manifest.ini`: an
//! RSA signature over the SHA-256 of the manifest, checked with
//! `openssl dgst -sha256 -verify <public key> -signature <sig> <manifest>`.

use crate::command::{CommandError, ToolCommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("manifest failed signature validation, openssl returned {code}: {message}")]
    Rejected { code: i32, message: String },

    #[error("failed to run signature check: {0}")]
    Tool(CommandError),
}

/// Verifies detached signatures with the OpenSSL command line
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    openssl: ToolCommand,
    public_key: PathBuf,
}

impl SignatureVerifier {
    pub fn new(openssl: ToolCommand, public_key: impl Into<PathBuf>) -> Self {
        Self {
            openssl,
            public_key: public_key.into(),
        }
    }

    /// Check `signature` over the contents of `data`
    pub fn verify(&self, data: &Path, signature: &Path) -> Result<(), SignatureError> {
        let args = [
            OsStr::new("dgst"),
            OsStr::new("-sha256"),
            OsStr::new("-verify"),
            self.public_key.as_os_str(),
            OsStr::new("-signature"),
            signature.as_os_str(),
            data.as_os_str(),
        ];
        match self.openssl.output(&args) {
            Ok(_) => {
                info!("Manifest signature verified");
                Ok(())
            }
            Err(CommandError::Failed { code, stderr, .. }) => Err(SignatureError::Rejected {
                code,
                message: stderr,
            }),
            Err(e) => Err(SignatureError::Tool(e)),
        }
    }
}
