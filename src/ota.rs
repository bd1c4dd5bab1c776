// MIT License - Copyright (c) 2021 TJForc
// Over-the-air upgrade transaction

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::constants::{CRC32_TABLE, HASH_SUFFIX, STAGED_SUFFIX};
use crate::error::{LinkError, Result};
use crate::http::{self, HeaderFlags, HttpRequest};
use crate::modem::Modem;
use crate::session::Session;
use crate::transport::at::AtTransport;
use crate::transport::SerialChannel;

/// Decides whether fetched bytes match their detached hash file.
pub trait IntegrityCheck {
    fn check(&self, data: &[u8], hash: &[u8]) -> bool;
}

/// Installs a fully staged set of files. Called at most once per
/// transaction, and only when every unit verified and staged.
#[allow(async_fn_in_trait)]
pub trait UpgradeApplier {
    async fn apply(&mut self, names: &[String]) -> bool;
}

/// CRC-32/ISO-HDLC (zlib, PNG, Ethernet).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

/// Hash files hold the CRC-32 of the artifact as 8 hex digits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrcIntegrity;

impl IntegrityCheck for CrcIntegrity {
    fn check(&self, data: &[u8], hash: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(hash) else {
            debug!("Hash file is not text");
            return false;
        };
        let expected = text.trim();
        let computed = format!("{:08x}", crc32(data));
        let valid = expected.eq_ignore_ascii_case(&computed);
        if !valid {
            debug!("CRC mismatch (expected {}, computed {})", expected, computed);
        }
        valid
    }
}

/// Moves every `<name>.new` over `<name>` in manifest order.
#[derive(Debug, Clone)]
pub struct StagedFileApplier {
    dir: PathBuf,
}

impl StagedFileApplier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl UpgradeApplier for StagedFileApplier {
    async fn apply(&mut self, names: &[String]) -> bool {
        for name in names {
            let staged = staged_path(&self.dir, name);
            let target = self.dir.join(name);
            if let Err(e) = tokio::fs::rename(&staged, &target).await {
                warn!("Failed to install {}: {}", target.display(), e);
                return false;
            }
            info!("Installed {}", target.display());
        }
        true
    }
}

fn staged_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, STAGED_SUFFIX))
}

/// One line of the manifest: a file name and, once its detached hash file
/// has been fetched, the hash it must match.
///
/// Names are UTF-8 because they are joined onto the staging directory.
/// The hash is kept as raw bytes and only interpreted by the
/// [`IntegrityCheck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    /// Empty until fetched.
    pub expected_hash: Vec<u8>,
}

impl ManifestEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_hash: Vec::new(),
        }
    }

    /// Name of the detached hash file.
    pub fn hash_name(&self) -> String {
        format!("{}{}", self.name, HASH_SUFFIX)
    }
}

/// A name stays inside the staging directory only if every component is a
/// plain file or directory name.
fn is_relative_file_name(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

/// Newline-separated file names. `\r` is trimmed and blank lines skipped.
///
/// `None` when the manifest is not UTF-8, or names a file outside the
/// staging directory (absolute, `..` or `.` components).
pub fn parse_manifest(manifest: &[u8]) -> Option<Vec<ManifestEntry>> {
    let Ok(text) = std::str::from_utf8(manifest) else {
        warn!("Manifest is not UTF-8");
        return None;
    };
    let mut entries = Vec::new();
    for name in text
        .split('\n')
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
    {
        if !is_relative_file_name(name) {
            warn!("Manifest names unsafe path {:?}", name);
            return None;
        }
        entries.push(ManifestEntry::new(name));
    }
    Some(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Never fetched.
    Pending,
    Fetched,
    Verified,
    Staged,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct UpgradeUnit {
    pub entry: ManifestEntry,
    pub data: Vec<u8>,
    pub state: UnitState,
}

impl UpgradeUnit {
    fn new(entry: ManifestEntry) -> Self {
        Self {
            entry,
            data: Vec::new(),
            state: UnitState::Pending,
        }
    }
}

/// All units of one upgrade cycle, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct UpgradeTransaction {
    pub units: Vec<UpgradeUnit>,
}

impl UpgradeTransaction {
    pub fn from_manifest(entries: Vec<ManifestEntry>) -> Self {
        Self {
            units: entries.into_iter().map(UpgradeUnit::new).collect(),
        }
    }

    pub fn all_staged(&self) -> bool {
        self.units.iter().all(|u| u.state == UnitState::Staged)
    }

    pub fn rejected(&self) -> Option<&UpgradeUnit> {
        self.units.iter().find(|u| u.state == UnitState::Rejected)
    }

    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.entry.name.clone()).collect()
    }

    pub fn state_of(&self, name: &str) -> Option<UnitState> {
        self.units
            .iter()
            .find(|u| u.entry.name == name)
            .map(|u| u.state)
    }
}

/// Why a cycle stopped before touching any unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NotRegistered,
    NoBearer,
    SslRefused,
    SessionFailed,
    ManifestUnavailable,
    ManifestRejected,
    /// Verified, but unreadable or naming files outside the staging directory.
    ManifestInvalid,
}

#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    Aborted(AbortReason),
    /// Units were processed. `applied` is the applier's verdict, or `false`
    /// when a unit was rejected and the applier never ran.
    Completed {
        transaction: UpgradeTransaction,
        applied: bool,
    },
}

impl UpgradeOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, UpgradeOutcome::Completed { applied: true, .. })
    }

    pub fn transaction(&self) -> Option<&UpgradeTransaction> {
        match self {
            UpgradeOutcome::Completed { transaction, .. } => Some(transaction),
            UpgradeOutcome::Aborted(_) => None,
        }
    }
}

/// GET one OTA artifact, reopening the socket if the peer closed it.
async fn fetch<C: SerialChannel>(
    session: &mut Session<'_, C>,
    config: &LinkConfig,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    if !session.is_connected()
        && !session
            .open_session(
                config.session_attempts,
                &config.server_address,
                config.server_port,
            )
            .await?
    {
        return Ok(None);
    }

    let flags = if config.keep_alive {
        HeaderFlags::KEEP_ALIVE
    } else {
        HeaderFlags::empty()
    };
    let request = HttpRequest::get(config.ota_path(name), flags);
    let exchange = http::exchange(session.transport(), request, config.idle_read_budget).await?;
    if exchange.peer_closed() {
        session.mark_closed();
    }
    if exchange.payload.is_none() {
        warn!("No payload for {} ({} bytes read)", name, exchange.response.len());
    }
    Ok(exchange.payload)
}

async fn stage(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let path = staged_path(dir, name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| LinkError::Staging {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(&path, data)
        .await
        .map_err(|source| LinkError::Staging {
            path: path.clone(),
            source,
        })?;
    debug!("Staged {} ({} bytes)", path.display(), data.len());
    Ok(())
}

/// Fetch, verify and stage every manifest unit on an open session.
async fn transact<C, I, A>(
    session: &mut Session<'_, C>,
    config: &LinkConfig,
    integrity: &I,
    applier: &mut A,
) -> Result<UpgradeOutcome>
where
    C: SerialChannel,
    I: IntegrityCheck,
    A: UpgradeApplier,
{
    let mut manifest_entry = ManifestEntry::new(config.ota_manifest.clone());
    let Some(manifest) = fetch(session, config, &manifest_entry.name).await? else {
        return Ok(UpgradeOutcome::Aborted(AbortReason::ManifestUnavailable));
    };
    manifest_entry.expected_hash = fetch(session, config, &manifest_entry.hash_name())
        .await?
        .unwrap_or_default();
    if !integrity.check(&manifest, &manifest_entry.expected_hash) {
        warn!("Manifest {} failed verification", manifest_entry.name);
        return Ok(UpgradeOutcome::Aborted(AbortReason::ManifestRejected));
    }

    let Some(entries) = parse_manifest(&manifest) else {
        return Ok(UpgradeOutcome::Aborted(AbortReason::ManifestInvalid));
    };
    let mut transaction = UpgradeTransaction::from_manifest(entries);
    info!("Manifest lists {} file(s)", transaction.units.len());

    for unit in transaction.units.iter_mut() {
        let name = unit.entry.name.clone();
        let Some(data) = fetch(session, config, &name).await? else {
            warn!("Could not fetch {}, rejecting", name);
            unit.state = UnitState::Rejected;
            break;
        };
        let Some(hash) = fetch(session, config, &unit.entry.hash_name()).await? else {
            warn!("Could not fetch hash of {}, rejecting", name);
            unit.state = UnitState::Rejected;
            break;
        };
        unit.data = data;
        unit.entry.expected_hash = hash;
        unit.state = UnitState::Fetched;

        if !integrity.check(&unit.data, &unit.entry.expected_hash) {
            warn!("{} failed verification, rejecting", name);
            unit.state = UnitState::Rejected;
            break;
        }
        unit.state = UnitState::Verified;

        stage(&config.staging_dir, &name, &unit.data).await?;
        unit.state = UnitState::Staged;
    }

    if !transaction.all_staged() {
        return Ok(UpgradeOutcome::Completed {
            transaction,
            applied: false,
        });
    }

    let applied = applier.apply(&transaction.names()).await;
    if applied {
        info!("Upgrade of {} file(s) applied", transaction.units.len());
    } else {
        warn!("Applier refused the staged upgrade");
    }
    Ok(UpgradeOutcome::Completed {
        transaction,
        applied,
    })
}

/// Run one OTA cycle end to end.
///
/// Bring-up failures abort before anything is fetched. A rejected manifest
/// aborts before any unit is fetched. A rejected unit stops the cycle; later
/// units stay `Pending` and the applier is never called. Staged files of an
/// unapplied transaction are left in place.
pub async fn run_upgrade<C, I, A>(
    at: &mut AtTransport<C>,
    config: &LinkConfig,
    integrity: &I,
    applier: &mut A,
) -> Result<UpgradeOutcome>
where
    C: SerialChannel,
    I: IntegrityCheck,
    A: UpgradeApplier,
{
    info!("Starting OTA cycle against {}", config.server_address);
    {
        let mut modem = Modem::new(at);
        if !modem.register_network(config.registration_attempts).await? {
            return Ok(UpgradeOutcome::Aborted(AbortReason::NotRegistered));
        }
        if modem
            .attach_bearer(&config.apn, config.bearer_attempts)
            .await?
            .is_none()
        {
            return Ok(UpgradeOutcome::Aborted(AbortReason::NoBearer));
        }
        if !modem.enable_ssl().await? {
            return Ok(UpgradeOutcome::Aborted(AbortReason::SslRefused));
        }
    }

    let mut session = Session::new(at);
    if !session
        .open_session(
            config.session_attempts,
            &config.server_address,
            config.server_port,
        )
        .await?
    {
        return Ok(UpgradeOutcome::Aborted(AbortReason::SessionFailed));
    }

    let outcome = transact(&mut session, config, integrity, applier).await?;
    if session.is_connected() {
        session.close().await?;
    }
    Ok(outcome)
}
