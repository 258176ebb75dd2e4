// Upgrade progress model, its UI projection and the on-disk recovery record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    #[default]
    Idle,
    Preparing,
    Verifying,
    Flashing,
    Rebooting,
    Completed,
    Failed,
}

impl UpgradeStatus {
    /// True while a worker owns the progress record.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Preparing
                | UpgradeStatus::Verifying
                | UpgradeStatus::Flashing
                | UpgradeStatus::Rebooting
        )
    }
}

/// The fixed phases of an upgrade, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Verify,
    WriteFlash,
    Reboot,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Prepare, Stage::Verify, Stage::WriteFlash, Stage::Reboot];

    pub fn id(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Verify => "verify",
            Stage::WriteFlash => "write_flash",
            Stage::Reboot => "reboot",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "Prepare",
            Stage::Verify => "Verify Firmware",
            Stage::WriteFlash => "Write Flash",
            Stage::Reboot => "Reboot",
        }
    }

    fn idle_description(&self) -> &'static str {
        match self {
            Stage::Prepare => "Check firmware and system requirements",
            Stage::Verify => "Verify firmware checksum",
            Stage::WriteFlash => "Write firmware to flash memory",
            Stage::Reboot => "Restart the device",
        }
    }
}

/// State of one upgrade, from `start_upgrade` until the next one replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeProgress {
    pub upgrade_id: String,
    pub status: UpgradeStatus,
    /// 0..=100, or -1 once the upgrade failed.
    pub progress_percentage: i32,
    pub current_stage: Option<Stage>,
    pub stage_description: String,
    #[serde(default)]
    pub upgrade_log: Vec<String>,
    #[serde(with = "epoch_millis")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "epoch_millis")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default = "no_stages_completed")]
    pub stages_completed: BTreeMap<Stage, bool>,
    #[serde(default)]
    pub estimated_completion: Option<DateTime<Utc>>,
}

fn no_stages_completed() -> BTreeMap<Stage, bool> {
    Stage::ALL.iter().map(|s| (*s, false)).collect()
}

/// Current time truncated to what the recovery file can represent.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

impl Default for UpgradeProgress {
    fn default() -> Self {
        let now = now_millis();
        UpgradeProgress {
            upgrade_id: String::new(),
            status: UpgradeStatus::Idle,
            progress_percentage: 0,
            current_stage: None,
            stage_description: String::new(),
            upgrade_log: Vec::new(),
            started_at: now,
            last_updated: now,
            error_message: String::new(),
            stages_completed: no_stages_completed(),
            estimated_completion: None,
        }
    }
}

impl UpgradeProgress {
    pub fn new(upgrade_id: String, estimated_completion: Option<DateTime<Utc>>) -> UpgradeProgress {
        UpgradeProgress {
            upgrade_id,
            estimated_completion,
            ..UpgradeProgress::default()
        }
    }

    pub fn is_stage_complete(&self, stage: Stage) -> bool {
        self.stages_completed.get(&stage).copied().unwrap_or(false)
    }

    /// Appends a timestamped line to the upgrade log.
    pub fn log(&mut self, message: &str) {
        let now = now_millis();
        self.upgrade_log
            .push(format!("[{}] {message}", now.format("%Y-%m-%d %H:%M:%S")));
        self.last_updated = now;
    }

    pub fn stages(&self) -> Vec<StageView> {
        project_stages(
            self.current_stage,
            &self.stages_completed,
            self.progress_percentage,
            &self.stage_description,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Complete,
    InProgress,
    Pending,
}

impl StageStatus {
    fn icon(&self) -> &'static str {
        match self {
            StageStatus::Complete => "✓",
            StageStatus::InProgress => "⟳",
            StageStatus::Pending => "○",
        }
    }
}

/// One row of the stage list shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageView {
    pub id: String,
    pub name: String,
    pub status: StageStatus,
    pub icon: String,
    pub description: String,
}

/// Derives the stage list from the progress fields. Nothing here is stored.
pub fn project_stages(
    current_stage: Option<Stage>,
    stages_completed: &BTreeMap<Stage, bool>,
    progress_percentage: i32,
    stage_description: &str,
) -> Vec<StageView> {
    Stage::ALL
        .iter()
        .map(|stage| {
            let complete = stages_completed.get(stage).copied().unwrap_or(false)
                || (progress_percentage >= 100 && current_stage.is_some());
            let status = if complete {
                StageStatus::Complete
            } else if current_stage == Some(*stage) {
                StageStatus::InProgress
            } else {
                StageStatus::Pending
            };

            let description = if status == StageStatus::InProgress && !stage_description.is_empty() {
                stage_description.to_string()
            } else {
                stage.idle_description().to_string()
            };

            StageView {
                id: stage.id().to_string(),
                name: stage.name().to_string(),
                status,
                icon: status.icon().to_string(),
                description,
            }
        })
        .collect()
}

/// What goes into the recovery file: the progress plus the derived stage list for readers that
/// only want to render it.
#[derive(Serialize)]
struct ProgressRecord<'a> {
    #[serde(flatten)]
    progress: &'a UpgradeProgress,
    stages: Vec<StageView>,
}

pub fn to_json(progress: &UpgradeProgress) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&ProgressRecord {
        progress,
        stages: progress.stages(),
    })
}

pub fn from_json(text: &str) -> serde_json::Result<UpgradeProgress> {
    serde_json::from_str(text)
}

/// Writes the snapshot atomically so a crash never leaves half a file behind.
pub fn save(progress: &UpgradeProgress, path: &Path) -> io::Result<()> {
    let json = to_json(progress).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

pub fn load(path: &Path) -> io::Result<UpgradeProgress> {
    let text = fs::read_to_string(path)?;
    from_json(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Timestamps travel as a string of milliseconds since the Unix epoch.
mod epoch_millis {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&t.timestamp_millis().to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        let ms: i64 = raw.parse().map_err(de::Error::custom)?;
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| de::Error::custom(format!("timestamp {ms} out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn completed(stages: &[Stage]) -> BTreeMap<Stage, bool> {
        Stage::ALL.iter().map(|s| (*s, stages.contains(s))).collect()
    }

    #[test]
    fn test_projection_of_running_upgrade() {
        let views = project_stages(
            Some(Stage::WriteFlash),
            &completed(&[Stage::Prepare, Stage::Verify]),
            60,
            "Writing firmware",
        );

        let statuses: Vec<StageStatus> = views.iter().map(|v| v.status).collect();
        assert_eq!(
            statuses,
            vec![StageStatus::Complete, StageStatus::Complete, StageStatus::InProgress, StageStatus::Pending]
        );
        assert_eq!(views[2].id, "write_flash");
        assert_eq!(views[2].description, "Writing firmware");
        assert_eq!(views[2].icon, "⟳");
        assert_eq!(views[3].description, "Restart the device");
    }

    #[test]
    fn test_projection_of_idle_and_finished() {
        let idle = project_stages(None, &completed(&[]), 0, "");
        assert!(idle.iter().all(|v| v.status == StageStatus::Pending));

        let done = project_stages(Some(Stage::Reboot), &completed(&Stage::ALL), 100, "Done");
        assert!(done.iter().all(|v| v.status == StageStatus::Complete && v.icon == "✓"));
    }

    #[test]
    fn test_failed_upgrade_keeps_completed_stages() {
        let views = project_stages(Some(Stage::Verify), &completed(&[Stage::Prepare]), -1, "Checksum failed");
        assert_eq!(views[0].status, StageStatus::Complete);
        assert_eq!(views[1].status, StageStatus::InProgress);
        assert_eq!(views[2].status, StageStatus::Pending);
    }

    #[test]
    fn test_json_keeps_identity_log_and_timestamps() {
        let mut progress = UpgradeProgress::new("upgrade_42".to_string(), Some(now_millis()));
        progress.status = UpgradeStatus::Flashing;
        progress.progress_percentage = 55;
        progress.current_stage = Some(Stage::WriteFlash);
        progress.stage_description = "Writing firmware".to_string();
        progress.stages_completed.insert(Stage::Prepare, true);
        progress.log("first");
        progress.log("second");

        let json = to_json(&progress).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "flashing");
        assert_eq!(value["current_stage"], "write_flash");
        assert_eq!(value["started_at"], progress.started_at.timestamp_millis().to_string());
        assert_eq!(value["stages"].as_array().unwrap().len(), 4);
        assert_eq!(value["stages"][0]["status"], "complete");

        let restored = from_json(&json).unwrap();
        assert_eq!(restored.upgrade_id, "upgrade_42");
        assert_eq!(restored.status, UpgradeStatus::Flashing);
        assert_eq!(restored.progress_percentage, 55);
        assert_eq!(restored.current_stage, Some(Stage::WriteFlash));
        assert_eq!(restored.upgrade_log, progress.upgrade_log);
        assert_eq!(restored.started_at.timestamp_millis(), progress.started_at.timestamp_millis());
        assert_eq!(restored.last_updated.timestamp_millis(), progress.last_updated.timestamp_millis());
        assert!(restored.is_stage_complete(Stage::Prepare));
        assert_eq!(restored, progress);
    }

    #[test]
    fn test_save_and_load() {
        let tmpdir = TempDir::new("progress").unwrap();
        let path = tmpdir.path().join("progress.json");

        let mut progress = UpgradeProgress::new("upgrade_1".to_string(), None);
        progress.log("hello");
        save(&progress, &path).unwrap();

        assert_eq!(load(&path).unwrap(), progress);
        assert!(load(&tmpdir.path().join("missing.json")).is_err());
    }
}
