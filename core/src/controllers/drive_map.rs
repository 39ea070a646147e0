//! Host directory to guest drive letter mappings.
//!
//! The table lives on the host and can be edited at any time; it is pushed
//! to the device on session start and on every explicit [`DriveMapController::apply`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sunpci_common::ioctl::{self, drive_flags, DriveLetter, DriveMapping, SUNPCI_MAX_DRIVE_MAPS};
use sunpci_common::{DriveMappingEntry, Request, Result, SunPciError};
use tracing::{debug, info, warn};

use crate::channel::DeviceChannel;
use crate::controllers::subscribe;
use crate::lock;
use crate::session::{SessionController, SessionEvent, SessionObserver};

/// First and last letters available for mapping; A-D belong to the
/// floppy and hard disk slots.
pub const FIRST_MAPPABLE: char = 'E';
pub const LAST_MAPPABLE: char = 'Z';

/// Parse user input such as `"f:"` or `"F"`.
pub fn parse_drive_letter(s: &str) -> Option<char> {
    let s = s.trim().trim_end_matches(':');
    let mut chars = s.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    if chars.next().is_some() || !(FIRST_MAPPABLE..=LAST_MAPPABLE).contains(&letter) {
        return None;
    }
    Some(letter)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriveMapFlags {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl DriveMapFlags {
    pub fn to_wire(self) -> u8 {
        let mut flags = 0;
        if self.readonly {
            flags |= drive_flags::READONLY;
        }
        if self.hidden {
            flags |= drive_flags::HIDDEN;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveMapEntry {
    #[serde(with = "letter_format")]
    pub drive_letter: char,
    pub host_path: String,
    #[serde(flatten)]
    pub flags: DriveMapFlags,
}

impl DriveMapEntry {
    fn to_wire(&self) -> Result<DriveMapping> {
        Ok(DriveMapping {
            letter: self.drive_letter as u8,
            flags: self.flags.to_wire(),
            reserved: 0,
            path: ioctl::encode_path(&self.host_path)?,
        })
    }
}

/// `'F'` is written as `"F:"` and either form is accepted back.
mod letter_format {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(letter: &char, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}:", letter))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<char, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_drive_letter(&s)
            .ok_or_else(|| de::Error::custom(format!("invalid drive letter {:?}", s)))
    }
}

/// Keyed set of mappings, at most one per letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveMapTable {
    entries: BTreeMap<char, DriveMapEntry>,
    limit: usize,
}

impl Default for DriveMapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveMapTable {
    pub fn new() -> Self {
        Self::with_limit(SUNPCI_MAX_DRIVE_MAPS)
    }

    /// A table holding at most `limit` entries; never more than the device cap.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit: limit.min(SUNPCI_MAX_DRIVE_MAPS),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, letter: char) -> Option<&DriveMapEntry> {
        self.entries.get(&letter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriveMapEntry> {
        self.entries.values()
    }

    /// Add a mapping; the table is unchanged on error.
    pub fn add(&mut self, letter: char, host_path: &str, flags: DriveMapFlags) -> Result<()> {
        if !(FIRST_MAPPABLE..=LAST_MAPPABLE).contains(&letter) {
            return Err(SunPciError::InvalidArgument(format!(
                "drive letter {:?} outside {}..{}",
                letter, FIRST_MAPPABLE, LAST_MAPPABLE
            )));
        }
        if self.entries.contains_key(&letter) {
            return Err(SunPciError::DuplicateMapping(letter));
        }
        if self.entries.len() >= self.limit {
            return Err(SunPciError::ResourceLimit(format!(
                "drive mapping table holds {} entries",
                self.limit
            )));
        }
        if host_path.is_empty() {
            return Err(SunPciError::InvalidArgument("empty host path".to_string()));
        }
        ioctl::encode_path(host_path)?;

        self.entries.insert(
            letter,
            DriveMapEntry {
                drive_letter: letter,
                host_path: host_path.to_string(),
                flags,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, letter: char) -> Option<DriveMapEntry> {
        self.entries.remove(&letter)
    }

    /// Letters in `E..=Z` not yet mapped.
    pub fn available_letters(&self) -> Vec<char> {
        (FIRST_MAPPABLE..=LAST_MAPPABLE)
            .filter(|letter| !self.entries.contains_key(letter))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<&DriveMapEntry> = self.entries.values().collect();
        serde_json::to_string_pretty(&entries)
            .map_err(|e| SunPciError::InvalidConfig(format!("drive mappings: {}", e)))
    }

    /// Build a table from exported JSON, applying the same checks as [`Self::add`].
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<DriveMapEntry> = serde_json::from_str(json)
            .map_err(|e| SunPciError::InvalidConfig(format!("drive mappings: {}", e)))?;
        let mut table = Self::new();
        for entry in entries {
            table.add(entry.drive_letter, &entry.host_path, entry.flags)?;
        }
        Ok(table)
    }

    /// Build a table from the enabled entries of the configuration store.
    pub fn from_config(entries: &[DriveMappingEntry]) -> Result<Self> {
        let mut table = Self::new();
        for entry in entries.iter().filter(|entry| entry.enabled) {
            let letter = parse_drive_letter(&entry.drive_letter).ok_or_else(|| {
                SunPciError::InvalidConfig(format!("invalid drive letter {:?}", entry.drive_letter))
            })?;
            let flags = DriveMapFlags {
                readonly: entry.readonly,
                hidden: entry.hidden,
            };
            table.add(letter, &entry.host_path.to_string_lossy(), flags)?;
        }
        Ok(table)
    }
}

#[derive(Debug, Default)]
struct Applied {
    epoch: Option<u64>,
    letters: BTreeSet<char>,
}

pub struct DriveMapController {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    table: Mutex<DriveMapTable>,
    applied: Mutex<Applied>,
    last_error: Mutex<Option<SunPciError>>,
}

impl DriveMapController {
    pub fn new(session: &Arc<SessionController>) -> Arc<Self> {
        Self::with_table(session, DriveMapTable::new())
    }

    pub fn with_table(session: &Arc<SessionController>, table: DriveMapTable) -> Arc<Self> {
        let controller = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            table: Mutex::new(table),
            applied: Mutex::new(Applied::default()),
            last_error: Mutex::new(None),
        });
        subscribe(session, &controller);
        controller
    }

    pub fn entries(&self) -> Vec<DriveMapEntry> {
        lock(&self.table).iter().cloned().collect()
    }

    pub fn get(&self, letter: char) -> Option<DriveMapEntry> {
        lock(&self.table).get(letter).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.table).is_empty()
    }

    pub fn available_letters(&self) -> Vec<char> {
        lock(&self.table).available_letters()
    }

    /// Letters acknowledged by the device in the running session.
    pub fn applied_letters(&self) -> Vec<char> {
        let applied = lock(&self.applied);
        match applied.epoch {
            Some(epoch) if self.session.is_current(epoch) => {
                applied.letters.iter().copied().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.last_error).clone()
    }

    /// Add a mapping to the local table. Takes effect on the next apply.
    pub fn add(&self, letter: char, host_path: &str, flags: DriveMapFlags) -> Result<()> {
        lock(&self.table)
            .add(letter, host_path, flags)
            .inspect_err(|e| self.record(e))?;
        info!("Drive mapping added: {}: -> {}", letter, host_path);
        Ok(())
    }

    /// Remove a mapping; if the device holds it, it is removed there too.
    ///
    /// Returns whether the letter was mapped. The local entry is gone even
    /// when the device request fails.
    pub fn remove(&self, letter: char) -> Result<bool> {
        if lock(&self.table).remove(letter).is_none() {
            return Ok(false);
        }
        info!("Drive mapping removed: {}:", letter);

        let on_device = {
            let applied = lock(&self.applied);
            applied.epoch.is_some_and(|epoch| self.session.is_current(epoch))
                && applied.letters.contains(&letter)
        };
        if on_device {
            self.unmap(letter).inspect_err(|e| self.record(e))?;
            lock(&self.applied).letters.remove(&letter);
        }
        Ok(true)
    }

    fn unmap(&self, letter: char) -> Result<()> {
        let request = Request::RemoveDriveMap(DriveLetter {
            letter: letter as u8,
            _pad: [0; 3],
        });
        self.channel.execute(request)?;
        debug!("Unmapped {}:", letter);
        Ok(())
    }

    /// Replace the table wholesale. Takes effect on the next apply.
    pub fn replace(&self, table: DriveMapTable) {
        *lock(&self.table) = table;
    }

    pub fn export_json(&self) -> Result<String> {
        lock(&self.table).to_json()
    }

    /// Replace the table from exported JSON; nothing changes on error.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let table = DriveMapTable::from_json(json).inspect_err(|e| self.record(e))?;
        let count = table.len();
        self.replace(table);
        Ok(count)
    }

    /// Make the device match the table.
    ///
    /// Letters the device holds that are no longer in the table are removed
    /// first, then every mapping is pushed. Stops at the first rejected
    /// letter and reports it; changes made before it stay in effect.
    pub fn apply(&self) -> Result<usize> {
        let Some(epoch) = self.session.running_epoch() else {
            let err = SunPciError::StateConflict(format!(
                "drive mappings can only be applied to a running session (session is {})",
                self.session.state()
            ));
            self.record(&err);
            return Err(err);
        };

        let entries = self.entries();
        let stale: Vec<char> = {
            let mut applied = lock(&self.applied);
            if applied.epoch != Some(epoch) {
                applied.epoch = Some(epoch);
                applied.letters.clear();
            }
            applied
                .letters
                .iter()
                .copied()
                .filter(|letter| !entries.iter().any(|entry| entry.drive_letter == *letter))
                .collect()
        };

        for letter in stale {
            if let Err(source) = self.unmap(letter) {
                let err = SunPciError::DriveMapApply {
                    letter,
                    source: Box::new(source),
                };
                warn!("{}", err);
                self.record(&err);
                return Err(err);
            }
            let mut applied = lock(&self.applied);
            if applied.epoch == Some(epoch) {
                applied.letters.remove(&letter);
            }
        }

        for entry in &entries {
            let result = entry
                .to_wire()
                .and_then(|wire| self.channel.execute(Request::AddDriveMap(Box::new(wire))));
            if let Err(source) = result {
                let err = SunPciError::DriveMapApply {
                    letter: entry.drive_letter,
                    source: Box::new(source),
                };
                warn!("{}", err);
                self.record(&err);
                return Err(err);
            }

            let mut applied = lock(&self.applied);
            if applied.epoch == Some(epoch) {
                applied.letters.insert(entry.drive_letter);
            }
            debug!("Mapped {}: -> {}", entry.drive_letter, entry.host_path);
        }

        info!("Applied {} drive mappings", entries.len());
        Ok(entries.len())
    }

    fn record(&self, err: &SunPciError) {
        *lock(&self.last_error) = Some(err.clone());
    }
}

impl SessionObserver for DriveMapController {
    fn on_session_event(&self, event: SessionEvent, _epoch: u64) {
        *lock(&self.applied) = Applied::default();
        if event == SessionEvent::Started && !self.is_empty() {
            // failures are kept in last_error
            let _ = self.apply();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drive_letter() {
        assert_eq!(parse_drive_letter("F:"), Some('F'));
        assert_eq!(parse_drive_letter("f"), Some('F'));
        assert_eq!(parse_drive_letter(" Z: "), Some('Z'));
        assert_eq!(parse_drive_letter("E:"), Some('E'));

        assert_eq!(parse_drive_letter("C:"), None);
        assert_eq!(parse_drive_letter("1:"), None);
        assert_eq!(parse_drive_letter("FG"), None);
        assert_eq!(parse_drive_letter(""), None);
    }

    #[test]
    fn test_duplicate_keeps_first_path() {
        let mut table = DriveMapTable::new();
        table.add('H', "/home/user", DriveMapFlags::default()).unwrap();
        assert_eq!(
            table.add('H', "/other", DriveMapFlags::default()),
            Err(SunPciError::DuplicateMapping('H'))
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get('H').unwrap().host_path, "/home/user");
    }

    #[test]
    fn test_letter_range() {
        let mut table = DriveMapTable::new();
        for letter in ['A', 'D', 'a', '[', '1'] {
            assert!(matches!(
                table.add(letter, "/tmp", DriveMapFlags::default()),
                Err(SunPciError::InvalidArgument(_))
            ));
        }
        assert!(table.is_empty());
        assert_eq!(table.available_letters().len(), 22);
    }

    #[test]
    fn test_limit_leaves_table_unchanged() {
        let mut table = DriveMapTable::with_limit(3);
        for letter in ['E', 'F', 'G'] {
            table.add(letter, "/srv", DriveMapFlags::default()).unwrap();
        }
        let before = table.clone();
        assert!(matches!(
            table.add('H', "/srv", DriveMapFlags::default()),
            Err(SunPciError::ResourceLimit(_))
        ));
        assert_eq!(table, before);
        assert_eq!(DriveMapTable::with_limit(100).limit(), SUNPCI_MAX_DRIVE_MAPS);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut table = DriveMapTable::new();
        let flags = DriveMapFlags {
            readonly: true,
            hidden: false,
        };
        table.add('F', "/opt/SUNWspci", flags).unwrap();
        table.add('H', "/home/user", DriveMapFlags::default()).unwrap();

        let json = table.to_json().unwrap();
        assert!(json.contains("\"driveLetter\": \"F:\""));
        assert_eq!(DriveMapTable::from_json(&json).unwrap(), table);
    }

    #[test]
    fn test_json_import_validates_letters() {
        let json = r#"[{"driveLetter":"C:","hostPath":"/"}]"#;
        assert!(matches!(
            DriveMapTable::from_json(json),
            Err(SunPciError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let entries = vec![
            DriveMappingEntry {
                drive_letter: "H:".to_string(),
                host_path: "/home/user".into(),
                readonly: true,
                hidden: false,
                enabled: true,
            },
            DriveMappingEntry {
                drive_letter: "J:".to_string(),
                host_path: "/mnt/off".into(),
                readonly: false,
                hidden: false,
                enabled: false,
            },
        ];
        let table = DriveMapTable::from_config(&entries).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get('H').unwrap().flags.readonly);
        assert_eq!(table.get('H').unwrap().to_wire().unwrap().flags, drive_flags::READONLY);
    }
}
