use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

/// Instance identity: a UUID persisted across restarts plus the current
/// process id, rendered `uuid-pid`.
///
/// The composite carries five hyphens (the UUID's four plus the joiner), so
/// parsing splits on the LAST hyphen. Splitting by digit class would break:
/// UUID segments can be all-digit too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceId {
    pub uuid: Uuid,
    pub pid: u32,
}

impl InstanceId {
    /// Load the persisted UUID (or mint and persist one) and append our pid.
    pub fn load_or_create(path: &str) -> Result<Self> {
        let uuid = match std::fs::read_to_string(path) {
            Ok(raw) => Uuid::parse_str(raw.trim())
                .with_context(|| format!("corrupt instance id file {path}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fresh = Uuid::new_v4();
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("create dir for {path}"))?;
                    }
                }
                std::fs::write(path, fresh.to_string())
                    .with_context(|| format!("persist instance id to {path}"))?;
                fresh
            }
            Err(e) => return Err(e).with_context(|| format!("read instance id file {path}")),
        };
        Ok(Self {
            uuid,
            pid: std::process::id(),
        })
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (uuid_part, pid_part) = raw.rsplit_once('-')?;
        Some(Self {
            uuid: Uuid::parse_str(uuid_part).ok()?,
            pid: pid_part.parse().ok()?,
        })
    }

    /// True when `other` renders the same composite id.
    pub fn matches(&self, other: &str) -> bool {
        self.to_string() == other
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.uuid, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_five_hyphens() {
        let id = InstanceId {
            uuid: Uuid::parse_str("0198e2f0-1111-4222-8333-123456789abc").unwrap(),
            pid: 4242,
        };
        assert_eq!(id.to_string().matches('-').count(), 5);
    }

    #[test]
    fn parse_splits_on_the_last_hyphen() {
        // All-digit UUID segments must not confuse the parser.
        let id = InstanceId {
            uuid: Uuid::parse_str("12345678-1234-4234-8234-123456789012").unwrap(),
            pid: 999,
        };
        let parsed = InstanceId::parse(&id.to_string()).expect("round-trips");
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(InstanceId::parse("not-a-uuid-at-all").is_none());
        assert!(InstanceId::parse("").is_none());
    }

    #[test]
    fn load_persists_the_uuid_across_restarts() {
        let dir = std::env::temp_dir().join(format!("ppm-ha-test-{}", std::process::id()));
        let path = dir.join("instance-id");
        let path_str = path.to_str().unwrap();
        let _ = std::fs::remove_file(&path);

        let first = InstanceId::load_or_create(path_str).expect("create");
        let second = InstanceId::load_or_create(path_str).expect("reload");
        assert_eq!(first.uuid, second.uuid);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }
}
