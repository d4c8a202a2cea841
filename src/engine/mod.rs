// src/engine/mod.rs

//! Update orchestration
//!
//! One run of the engine installs one bundle:
//!
//! ```text
//! Init -> SlotsResolved -> ArchiveOpened -> ManifestValidated
//!      -> Dispatching(class) -> Finalizing -> Done
//! ```
//!
//! Any step may fail instead. A failure is reported once, at the top of
//! [`UpdateEngine::run`]: the error text goes to the status directory, a
//! terminal telemetry event carries the exit code, staging files are
//! deleted, and the code is returned for the process to exit with.
//!
//! The target slot is made unbootable before any image is written and only
//! activated after a successful disk sync.

mod handlers;
mod state;

pub use state::UpdateState;

use crate::command::ToolCommand;
use crate::config::EngineConfig;
use crate::delta::{ExternalPayloadEngine, PayloadEngine};
use crate::error::{Error, Result, exit_code};
use crate::extract::{ExtractError, Extractor, next_entry};
use crate::manifest::{
    MANIFEST_ENTRY, MANIFEST_SIGNATURE_ENTRY, Manifest, ManifestValidator, UpdateClass,
};
use crate::platform::{
    DeviceIdentity, EventSink, HostOps, LogEventCommand, PropertyIdentity, SystemHost,
    TracingEvents,
};
use crate::progress::ProgressTracker;
use crate::signature::SignatureVerifier;
use crate::slot::{
    BootControl, BootctlCommand, Partition, Slot, SlotAction, SlotLayout, SlotPair, read_cmdline,
};
use crate::source::{AUTO, BundleSource, automatic_url, inhibit_marker};
use crate::status::StatusSink;
use std::fs;
use std::io::Read;
use tracing::{debug, error, info, warn};

/// Telemetry event emitted when a run starts
pub const START_EVENT: &str = "robot.ota_download_start";
/// Telemetry event emitted when a run ends, successfully or not
pub const END_EVENT: &str = "robot.ota_download_end";
/// Telemetry event emitted before the end event of a stalled transfer
pub const STALLED_EVENT: &str = "robot.ota_download_stalled";

/// The over-the-air update engine
pub struct UpdateEngine {
    config: EngineConfig,
    status: StatusSink,
    layout: SlotLayout,
    extractor: Extractor,
    source: BundleSource,
    boot_control: Box<dyn BootControl>,
    host: Box<dyn HostOps>,
    identity: Box<dyn DeviceIdentity>,
    events: Box<dyn EventSink>,
    payload_engine: Box<dyn PayloadEngine>,
    signature: Option<SignatureVerifier>,
    state: UpdateState,
}

impl UpdateEngine {
    /// Engine wired to the platform utilities named in `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        let tools = &config.tools;
        let paths = &config.paths;

        let signature = config.policy.verify_manifest_signature.then(|| {
            SignatureVerifier::new(ToolCommand::new(&tools.openssl), &paths.public_key)
        });

        Ok(Self {
            status: StatusSink::new(&paths.status_dir),
            layout: SlotLayout::new(&paths.device_dir, config.transfer.write_block),
            extractor: Extractor::new(config.pipeline_options())
                .with_write_block(config.transfer.write_block)
                .with_digest_verification(config.policy.verify_image_digests),
            source: BundleSource::new(config.timeout())?,
            boot_control: Box::new(BootctlCommand::new(&tools.bootctl)),
            host: Box::new(SystemHost::new(
                ToolCommand::new(&tools.sync),
                ToolCommand::new(&tools.mount),
                ToolCommand::new(&tools.reboot),
            )),
            identity: Box::new(PropertyIdentity::new(
                ToolCommand::new(&tools.getprop),
                &paths.serial_file,
                config.policy.dev_class,
            )),
            events: if tools.log_event.as_os_str().is_empty() {
                Box::new(TracingEvents)
            } else {
                Box::new(LogEventCommand::new(ToolCommand::new(&tools.log_event)))
            },
            payload_engine: Box::new(ExternalPayloadEngine::new(ToolCommand::new(
                &tools.payload_engine,
            ))),
            signature,
            state: UpdateState::Init,
            config,
        })
    }

    pub fn with_boot_control(mut self, boot_control: Box<dyn BootControl>) -> Self {
        self.boot_control = boot_control;
        self
    }

    pub fn with_host(mut self, host: Box<dyn HostOps>) -> Self {
        self.host = host;
        self
    }

    pub fn with_identity(mut self, identity: Box<dyn DeviceIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_events(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_payload_engine(mut self, engine: Box<dyn PayloadEngine>) -> Self {
        self.payload_engine = engine;
        self
    }

    pub fn with_signature_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.signature = Some(verifier);
        self
    }

    /// Mirror status progress onto a progress tracker
    pub fn with_progress(mut self, progress: Box<dyn ProgressTracker>) -> Self {
        self.status = StatusSink::new(&self.config.paths.status_dir).with_mirror(progress);
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    /// Install the bundle at `location` and report the outcome
    ///
    /// Returns the process exit code, `0` on success.
    pub fn run(&mut self, location: &str) -> i32 {
        self.events.emit(START_EVENT, &[]);
        let result = self
            .status
            .clear()
            .map_err(Error::from)
            .and_then(|_| self.update(location));

        match result {
            Ok(()) => {
                if let Err(e) = self.status.remove_staging_files() {
                    warn!("Failed to delete staging files: {}", e);
                }
                exit_code::SUCCESS
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Resolve `location` and install from it, without failure reporting
    pub fn update(&mut self, location: &str) -> Result<()> {
        let url = if location == AUTO {
            self.automatic_location()?
        } else {
            location.to_string()
        };
        self.install(&url)
    }

    fn automatic_location(&self) -> Result<String> {
        if let Some(marker) = inhibit_marker(&self.config.paths.inhibit_markers) {
            return Err(Error::Inhibited(marker.to_path_buf()));
        }
        info!("Automatic update running");
        Ok(automatic_url(&self.config.auto, self.identity.as_ref())?)
    }

    fn install(&mut self, url: &str) -> Result<()> {
        self.status.set_phase("download")?;

        let cmdline = read_cmdline(&self.config.paths.cmdline)?;
        let slots = SlotPair::from_cmdline(&cmdline);
        self.layout.validate(&[slots.target()])?;
        info!("Current slot {}, target slot {}", slots.current(), slots.target());
        self.transition(UpdateState::SlotsResolved);

        let stream = self.source.open(url, self.identity.as_ref())?;
        if let Some(length) = stream.content_length() {
            self.status.set_expected_download_size(length)?;
        }
        let mut archive = tar::Archive::new(stream.into_reader());
        let mut entries = archive.entries().map_err(Error::ArchiveOpen)?;
        self.transition(UpdateState::ArchiveOpened);

        let manifest = self.read_manifest(&mut entries)?;
        let class = ManifestValidator::new(self.identity.as_ref(), self.config.validation_policy())
            .validate(&manifest)?;
        self.transition(UpdateState::ManifestValidated);

        self.prepare_target(slots, class)?;
        self.transition(UpdateState::Dispatching(class));
        self.dispatch(slots, class, &manifest, &mut entries)?;
        drop(entries);

        self.transition(UpdateState::Finalizing);
        self.finalize(slots, class, &manifest)?;
        self.transition(UpdateState::Done);
        Ok(())
    }

    /// Read, save and optionally verify the leading manifest entry
    fn read_manifest<R: Read>(&self, entries: &mut tar::Entries<'_, R>) -> Result<Manifest> {
        let raw = read_entry(entries, MANIFEST_ENTRY)?;
        let manifest_path = self.status.save_manifest(&raw)?;

        if let Some(verifier) = &self.signature {
            let signature = read_entry(entries, MANIFEST_SIGNATURE_ENTRY)?;
            let signature_path = self.status.save_manifest_signature(&signature)?;
            verifier.verify(&manifest_path, &signature_path)?;
        }

        let manifest = Manifest::from_bytes(&raw)?;
        info!("Updating to version {}", manifest.meta().update_version);
        Ok(manifest)
    }

    /// Make the target unbootable before anything is written to it
    fn prepare_target(&self, slots: SlotPair, class: UpdateClass) -> Result<()> {
        let target = slots.target();
        match class {
            UpdateClass::RootOverlay => {}
            UpdateClass::SystemImage => {
                self.layout.zero_first_block(target, &[Partition::System])?;
            }
            UpdateClass::Delta => {
                self.layout
                    .zero_first_block(target, &[Partition::Boot, Partition::System])?;
            }
            UpdateClass::FullImage | UpdateClass::Factory => {
                self.boot_control
                    .apply(slots.current(), SlotAction::SetUnbootable, target)?;
                self.layout
                    .zero_first_block(target, &[Partition::Boot, Partition::System])?;
            }
        }
        Ok(())
    }

    fn finalize(&self, slots: SlotPair, class: UpdateClass, manifest: &Manifest) -> Result<()> {
        self.host.sync().map_err(Error::Sync)?;

        let current = slots.current();
        match class {
            UpdateClass::FullImage => {
                self.boot_control
                    .apply(current, SlotAction::SetActive, slots.target())?;
            }
            UpdateClass::Factory => {
                fs::write(&self.config.paths.wipe_cookie, "1")?;
                self.boot_control
                    .apply(current, SlotAction::SetUnbootable, Slot::A)?;
                self.boot_control
                    .apply(current, SlotAction::SetUnbootable, Slot::B)?;
            }
            UpdateClass::SystemImage | UpdateClass::Delta | UpdateClass::RootOverlay => {
                debug!("Slot activation skipped for {} update", class);
            }
        }

        self.status.clear_error()?;
        self.status.set_done()?;
        let meta = manifest.meta();
        self.events
            .emit(END_EVENT, &["success".to_string(), meta.update_version.clone()]);
        info!("Update to {} complete", meta.update_version);

        if meta.reboot_after_install {
            info!("Rebooting");
            if let Err(e) = self.host.reboot() {
                warn!("Reboot failed: {}", e);
            }
        }
        Ok(())
    }

    /// Report a fatal error and return its exit code
    fn fail(&mut self, err: &Error) -> i32 {
        let code = err.exit_code();
        error!("Update failed in state {} ({}): {}", self.state, code, err);
        if self.state.touched_target() {
            warn!("Target may hold a partial update");
        }
        self.transition(UpdateState::Failed(code));

        if err.is_stalled() {
            self.events.emit(STALLED_EVENT, &[]);
        }
        let text = err.to_string();
        if let Err(e) = self.status.set_error(&text) {
            warn!("Failed to write error status: {}", e);
        }
        self.events.emit(
            END_EVENT,
            &[
                "fail".to_string(),
                self.identity.os_version(),
                text,
                String::new(),
                code.to_string(),
            ],
        );
        if let Err(e) = self.status.remove_staging_files() {
            warn!("Failed to delete staging files: {}", e);
        }
        code
    }

    fn transition(&mut self, next: UpdateState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

/// Read a small named entry whole
fn read_entry<R: Read>(entries: &mut tar::Entries<'_, R>, suffix: &str) -> Result<Vec<u8>> {
    let mut entry = next_entry(entries, suffix)?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(ExtractError::Archive)?;
    Ok(content)
}
