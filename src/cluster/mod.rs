// src/cluster/mod.rs

//! Cluster membership and quorum recovery.
//!
//! This surface operates out-of-band: with the daemon stopped it edits the
//! raft configuration directly on this member's local replica. The raft
//! engine itself is an external collaborator; only its administrative
//! state lives here.

pub mod editor;

use crate::db;
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Comment decorating show/edit output with the newest closed segment
pub const SEGMENT_COMMENT: &str = "# Latest dqlite segment ID:";

/// Raft roles; only voters vote, stand-bys can be promoted, spares are
/// passive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RaftRole {
    Voter,
    StandBy,
    Spare,
}

impl RaftRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voter => "voter",
            Self::StandBy => "stand-by",
            Self::Spare => "spare",
        }
    }

    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Voter),
            1 => Ok(Self::StandBy),
            2 => Ok(Self::Spare),
            other => Err(Error::Validation(format!("Unknown raft role: {}", other))),
        }
    }

    fn to_i64(self) -> i64 {
        match self {
            Self::Voter => 0,
            Self::StandBy => 1,
            Self::Spare => 2,
        }
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One member of the raft configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub address: String,
    pub role: RaftRole,
}

/// The YAML document shown to and read back from the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: Vec<ClusterMember>,
}

/// Read the raft configuration from the local database
pub fn get_raft_nodes(conn: &Connection) -> Result<Vec<ClusterMember>> {
    let mut stmt =
        conn.prepare("SELECT id, name, address, role FROM raft_nodes ORDER BY id")?;

    let members = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    members
        .into_iter()
        .map(|(id, name, address, role)| {
            Ok(ClusterMember {
                id: id as u64,
                name,
                address,
                role: RaftRole::from_i64(role)?,
            })
        })
        .collect()
}

/// Addresses of the members serving the database (voters and stand-bys)
pub fn list_database_nodes(conn: &Connection) -> Result<Vec<String>> {
    Ok(get_raft_nodes(conn)?
        .into_iter()
        .filter(|m| matches!(m.role, RaftRole::Voter | RaftRole::StandBy))
        .map(|m| m.address)
        .collect())
}

/// Validate an edited configuration against the current one.
///
/// Membership edits may re-arrange addresses and roles but never add,
/// remove or renumber members; names only change when one side is blank;
/// a spare cannot jump straight to voter; and the voter count floor
/// depends on the cluster size.
pub fn validate_new_config(old: &[ClusterMember], new: &[ClusterMember]) -> Result<()> {
    if old.len() > new.len() {
        return Err(Error::Validation(
            "Removing cluster members is not supported".to_string(),
        ));
    }

    if old.len() < new.len() {
        return Err(Error::Validation(
            "Adding cluster members is not supported".to_string(),
        ));
    }

    let mut voters = 0usize;
    for (old_member, new_member) in old.iter().zip(new.iter()) {
        // IDs should not be reordered among cluster members.
        if old_member.id != new_member.id {
            return Err(Error::Validation(
                "Changing cluster member ID is not supported".to_string(),
            ));
        }

        // If the name field could not be populated, just ignore the new
        // value.
        if !old_member.name.is_empty()
            && !new_member.name.is_empty()
            && old_member.name != new_member.name
        {
            return Err(Error::Validation(
                "Changing cluster member name is not supported".to_string(),
            ));
        }

        if old_member.role == RaftRole::Spare && new_member.role == RaftRole::Voter {
            return Err(Error::Validation(format!(
                "A {:?} cluster member cannot become a {:?}",
                RaftRole::Spare.as_str(),
                RaftRole::Voter.as_str()
            )));
        }

        if new_member.role == RaftRole::Voter {
            voters += 1;
        }
    }

    if voters < 2 && new.len() > 2 {
        return Err(Error::Validation(format!(
            "Number of {:?} must be 2 or more",
            RaftRole::Voter.as_str()
        )));
    } else if voters < 1 {
        return Err(Error::Validation(format!(
            "At least one member must be a {:?}",
            RaftRole::Voter.as_str()
        )));
    }

    Ok(())
}

/// Replace the local raft configuration with a validated member list
pub fn reconfigure(conn: &mut Connection, members: &[ClusterMember]) -> Result<()> {
    db::transaction(conn, |tx| {
        tx.execute("DELETE FROM raft_nodes", [])?;
        for member in members {
            tx.execute(
                "INSERT INTO raft_nodes (id, name, address, role) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    member.id as i64,
                    member.name,
                    member.address,
                    member.role.to_i64()
                ],
            )?;
        }
        Ok(())
    })
}

/// Rewrite the local replica to a single-voter cluster of just this node.
///
/// Rows about former members in the cluster database are preserved so
/// they can later be force-removed cleanly.
pub fn recover_from_quorum_loss(conn: &mut Connection) -> Result<()> {
    let local_address = db::node_config_get(conn, "cluster.https_address")?
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            Error::Validation(
                "Can't recover as server isn't clustered (missing \"cluster.https_address\" config)"
                    .to_string(),
            )
        })?;

    let members = get_raft_nodes(conn)?;
    let local = members
        .iter()
        .find(|m| m.address == local_address)
        .cloned()
        .unwrap_or(ClusterMember {
            id: 1,
            name: String::new(),
            address: local_address,
            role: RaftRole::Voter,
        });

    reconfigure(
        conn,
        &[ClusterMember {
            role: RaftRole::Voter,
            ..local
        }],
    )
}

/// Newest closed dqlite segment in the database directory, as a display
/// string
///
/// Closed segments are named `<first>-<last>` with zero-padded indexes;
/// the answer is the largest `last`. `0` when no segment exists yet.
pub fn latest_segment_id(database_dir: &Path) -> String {
    let mut latest = 0u64;

    if let Ok(entries) = std::fs::read_dir(database_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((first, last)) = name.split_once('-') else {
                continue;
            };

            if first.len() != 16 || last.len() != 16 {
                continue;
            }

            if let (Ok(_), Ok(last)) = (first.parse::<u64>(), last.parse::<u64>()) {
                latest = latest.max(last);
            }
        }
    }

    latest.to_string()
}

/// Render the configuration as the operator-facing YAML document
pub fn render_config(members: &[ClusterMember], segment_id: &str) -> Result<String> {
    let config = ClusterConfig {
        members: members.to_vec(),
    };

    let yaml = serde_yaml::to_string(&config)?;

    if members.is_empty() {
        Ok(yaml)
    } else {
        Ok(format!("{} {}\n\n{}", SEGMENT_COMMENT, segment_id, yaml))
    }
}

/// Parse an edited YAML document back into a member list
pub fn parse_config(content: &str) -> Result<Vec<ClusterMember>> {
    let config: ClusterConfig = serde_yaml::from_str(content)?;
    Ok(config.members)
}

/// Canonicalise a member address, defaulting the port
pub fn canonical_address(address: &str, default_port: u16) -> String {
    if address.rsplit_once(':').is_some_and(|(host, port)| {
        !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty()
    }) {
        address.to_string()
    } else {
        format!("{}:{}", address.trim_end_matches(':'), default_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, role: RaftRole) -> ClusterMember {
        ClusterMember {
            id,
            name: name.to_string(),
            address: format!("10.0.0.{}:8443", id),
            role,
        }
    }

    fn three_voters() -> Vec<ClusterMember> {
        vec![
            member(1, "n1", RaftRole::Voter),
            member(2, "n2", RaftRole::Voter),
            member(3, "n3", RaftRole::Voter),
        ]
    }

    #[test]
    fn test_validate_add_remove_rejected() {
        let old = three_voters();

        let mut shorter = old.clone();
        shorter.pop();
        assert_eq!(
            validate_new_config(&old, &shorter).unwrap_err().to_string(),
            "Removing cluster members is not supported"
        );

        let mut longer = old.clone();
        longer.push(member(4, "n4", RaftRole::Spare));
        assert_eq!(
            validate_new_config(&old, &longer).unwrap_err().to_string(),
            "Adding cluster members is not supported"
        );
    }

    #[test]
    fn test_validate_id_change_rejected() {
        let old = three_voters();
        let mut new = old.clone();
        new[1].id = 99;

        assert_eq!(
            validate_new_config(&old, &new).unwrap_err().to_string(),
            "Changing cluster member ID is not supported"
        );
    }

    #[test]
    fn test_validate_name_change_rejected_unless_blank() {
        let old = three_voters();

        let mut renamed = old.clone();
        renamed[0].name = "other".to_string();
        assert_eq!(
            validate_new_config(&old, &renamed).unwrap_err().to_string(),
            "Changing cluster member name is not supported"
        );

        // A blank name on either side is ignored
        let mut blank_old = old.clone();
        blank_old[0].name = String::new();
        let mut filled = blank_old.clone();
        filled[0].name = "n1".to_string();
        assert!(validate_new_config(&blank_old, &filled).is_ok());
    }

    #[test]
    fn test_validate_spare_promotion_rejected() {
        let old = vec![
            member(1, "n1", RaftRole::Voter),
            member(2, "n2", RaftRole::Voter),
            member(3, "n3", RaftRole::Spare),
        ];
        let mut new = old.clone();
        new[2].role = RaftRole::Voter;

        let err = validate_new_config(&old, &new).unwrap_err().to_string();
        assert!(err.contains("cannot become"));
    }

    #[test]
    fn test_validate_voter_floor() {
        // 3+ members need at least two voters
        let old = three_voters();
        let mut new = old.clone();
        new[1].role = RaftRole::StandBy;
        new[2].role = RaftRole::StandBy;

        let err = validate_new_config(&old, &new).unwrap_err().to_string();
        assert!(err.contains("must be 2 or more"));

        // A two-member cluster needs only one voter
        let old2 = vec![
            member(1, "n1", RaftRole::Voter),
            member(2, "n2", RaftRole::Voter),
        ];
        let mut new2 = old2.clone();
        new2[1].role = RaftRole::StandBy;
        assert!(validate_new_config(&old2, &new2).is_ok());

        // But never zero voters
        let mut none = new2.clone();
        none[0].role = RaftRole::StandBy;
        let err = validate_new_config(&old2, &none).unwrap_err().to_string();
        assert!(err.contains("At least one member"));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let old = three_voters();
        let mut new = old.clone();
        new[2].role = RaftRole::StandBy;

        validate_new_config(&old, &new).unwrap();
        // Applying the validated config and validating again converges
        validate_new_config(&new, &new).unwrap();
    }

    #[test]
    fn test_reconfigure_and_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        db::schema::migrate_local(&conn).unwrap();
        let mut conn = conn;

        reconfigure(&mut conn, &three_voters()).unwrap();
        let loaded = get_raft_nodes(&conn).unwrap();
        assert_eq!(loaded, three_voters());

        assert_eq!(
            list_database_nodes(&conn).unwrap(),
            vec!["10.0.0.1:8443", "10.0.0.2:8443", "10.0.0.3:8443"]
        );
    }

    #[test]
    fn test_recover_from_quorum_loss() {
        let conn = Connection::open_in_memory().unwrap();
        db::schema::migrate_local(&conn).unwrap();
        let mut conn = conn;

        db::node_config_set(&conn, "cluster.https_address", "10.0.0.2:8443").unwrap();
        let mut members = three_voters();
        members[1].role = RaftRole::StandBy;
        reconfigure(&mut conn, &members).unwrap();

        recover_from_quorum_loss(&mut conn).unwrap();

        let remaining = get_raft_nodes(&conn).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
        assert_eq!(remaining[0].address, "10.0.0.2:8443");
        assert_eq!(remaining[0].role, RaftRole::Voter);
    }

    #[test]
    fn test_yaml_roundtrip_with_segment_comment() {
        let members = three_voters();
        let rendered = render_config(&members, "42").unwrap();
        assert!(rendered.starts_with("# Latest dqlite segment ID: 42"));

        // The comment parses away
        let parsed = parse_config(&rendered).unwrap();
        assert_eq!(parsed, members);

        // No members: no comment
        let empty = render_config(&[], "42").unwrap();
        assert!(!empty.contains("segment"));
    }

    #[test]
    fn test_latest_segment_id() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_segment_id(dir.path()), "0");

        std::fs::write(dir.path().join("0000000000000001-0000000000000042"), b"").unwrap();
        std::fs::write(dir.path().join("0000000000000043-0000000000000099"), b"").unwrap();
        std::fs::write(dir.path().join("cluster.db"), b"").unwrap();

        assert_eq!(latest_segment_id(dir.path()), "99");
    }

    #[test]
    fn test_canonical_address() {
        assert_eq!(canonical_address("10.0.0.1", 8443), "10.0.0.1:8443");
        assert_eq!(canonical_address("10.0.0.1:9999", 8443), "10.0.0.1:9999");
        assert_eq!(canonical_address("node1:", 8443), "node1:8443");
    }
}
