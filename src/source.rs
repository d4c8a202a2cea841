// src/source.rs

//! Bundle sources
//!
//! A bundle is read once, front to back, from either an HTTP(S) URL or a
//! local file. For `auto` runs the URL is built from the automatic-update
//! settings and the running firmware version, after checking that no
//! inhibit marker is present.

use crate::config::AutoSection;
use crate::hash::shard_bucket;
use crate::platform::{
    BUILD_TARGET_PROP, DeviceIdentity, SERIALNO_PROP, VICTOR_VERSION_PROP,
};
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Location keyword selecting the automatic update URL
pub const AUTO: &str = "auto";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unable to construct automatic update url")]
    NoAutomaticUrl,

    #[error("invalid update url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("unsupported url scheme {0}")]
    UnsupportedScheme(String),

    #[error("failed to open url: {0}")]
    Open(String),

    #[error("server returned {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("failed to open {}: {source}", .path.display())]
    Local { path: PathBuf, source: io::Error },

    #[error("socket timeout: {0}")]
    Stalled(String),
}

/// First inhibit marker that exists, if any
pub fn inhibit_marker(markers: &[PathBuf]) -> Option<&Path> {
    markers
        .iter()
        .map(PathBuf::as_path)
        .find(|path| path.exists())
}

/// Two-digit shard for a serial number, unless overridden
pub fn shard_id(settings: &AutoSection, serial: &str) -> String {
    match settings.shard.as_deref() {
        Some(shard) if !shard.is_empty() => shard.to_string(),
        _ => format!("{:02}", shard_bucket(serial.as_bytes())),
    }
}

/// Build the automatic update URL for the running version
///
/// `<base><shard>/<ota type>/<version>.ota`, the shard part present only
/// with sharding enabled and the version stripped of trailing `u`/`d`.
pub fn automatic_url(
    settings: &AutoSection,
    identity: &dyn DeviceIdentity,
) -> Result<String, SourceError> {
    let mut base = settings.base_url.as_deref();
    if identity.is_dev_class() && settings.dev_base_url.is_some() {
        base = settings.dev_base_url.as_deref();
    }
    let base = base
        .filter(|b| !b.is_empty())
        .ok_or(SourceError::NoAutomaticUrl)?;

    let shard = if settings.use_sharding {
        let serial = identity.property(SERIALNO_PROP).unwrap_or_default();
        format!("{}/", shard_id(settings, &serial))
    } else {
        String::new()
    };

    let version = identity.os_version();
    let url = format!(
        "{}{}{}/{}.ota",
        base,
        shard,
        settings.ota_type,
        version.trim_end_matches(['u', 'd'])
    );
    info!("Automatic URL = {}", url);
    Ok(url)
}

/// An opened bundle stream
pub struct BundleStream {
    reader: Box<dyn Read>,
    content_length: Option<u64>,
}

impl BundleStream {
    /// Declared length of the encoded bundle, when known
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn into_reader(self) -> Box<dyn Read> {
        self.reader
    }
}

/// Opens bundle locations
pub struct BundleSource {
    client: Client,
}

impl BundleSource {
    /// HTTP client whose connects and reads give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Open(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Open an `http(s)://` URL or a local bundle path
    pub fn open(&self, location: &str, identity: &dyn DeviceIdentity) -> Result<BundleStream, SourceError> {
        if !location.contains("://") {
            return open_local(Path::new(location));
        }

        let url = device_url(location, identity)?;
        let os_version = identity.os_version();
        debug!("Requesting {}", url);

        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, format!("Victor-OTA/{}", os_version))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Stalled(e.to_string())
                } else {
                    SourceError::Open(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();
        info!("Opened {} ({:?} bytes)", url, content_length);
        Ok(BundleStream {
            reader: Box::new(HttpBody { response }),
            content_length,
        })
    }
}

/// Append device identification to an HTTP(S) URL
pub fn device_url(location: &str, identity: &dyn DeviceIdentity) -> Result<Url, SourceError> {
    let mut url = Url::parse(location).map_err(|e| SourceError::InvalidUrl {
        url: location.to_string(),
        message: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourceError::UnsupportedScheme(url.scheme().to_string()));
    }

    let prop = |name: &str| identity.property(name).unwrap_or_default();
    url.query_pairs_mut()
        .append_pair("emresn", &prop(SERIALNO_PROP))
        .append_pair("ankiversion", &identity.os_version())
        .append_pair("victorversion", &prop(VICTOR_VERSION_PROP))
        .append_pair("victortarget", &prop(BUILD_TARGET_PROP));
    Ok(url)
}

fn open_local(path: &Path) -> Result<BundleStream, SourceError> {
    let local_err = |source| SourceError::Local {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(local_err)?;
    let content_length = file.metadata().map_err(local_err)?.len();
    info!("Opened local bundle {}", path.display());
    Ok(BundleStream {
        reader: Box::new(file),
        content_length: Some(content_length),
    })
}

/// Response body whose read timeouts surface as `TimedOut`
struct HttpBody {
    response: Response,
}

impl Read for HttpBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf).map_err(|e| {
            let timed_out = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out && e.kind() != ErrorKind::TimedOut {
                io::Error::new(ErrorKind::TimedOut, e)
            } else {
                e
            }
        })
    }
}
