//! Persistence of finished runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use nodes::RunOutcome;

/// Files written for one run.
#[derive(Debug)]
pub struct WrittenFiles {
    pub state: PathBuf,
    pub report: Option<PathBuf>,
}

/// Writes `state.json` and, when a report exists, `report.md` into
/// `<output_dir>/<run_id>/`.
pub fn write_run(output_dir: &Path, outcome: &RunOutcome) -> anyhow::Result<WrittenFiles> {
    let dir = output_dir.join(outcome.run_id.to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let state = dir.join("state.json");
    let json = serde_json::to_string_pretty(&outcome.state).context("serialising run state")?;
    std::fs::write(&state, json).with_context(|| format!("writing {}", state.display()))?;

    let report = match &outcome.state.report {
        Some(report) => {
            let path = dir.join("report.md");
            std::fs::write(&path, report.to_markdown())
                .with_context(|| format!("writing {}", path.display()))?;
            Some(path)
        }
        None => None,
    };
    Ok(WrittenFiles { state, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{PipelineRunId, PipelineState, ResearchQuery, ResearchReport, RunStatus, Timestamp};

    fn outcome(with_report: bool) -> RunOutcome {
        let query = ResearchQuery::builder("How do students learn optics?").build().unwrap();
        let mut state = PipelineState::new(query);
        if with_report {
            state.report = Some(ResearchReport {
                title: "Optics".into(),
                executive_summary: "Labs help.".into(),
                sections: vec![],
                references: vec![],
                word_count: 2,
                generated_at: Timestamp::now(),
                revision: 0,
            });
        }
        RunOutcome {
            run_id: PipelineRunId::new_random(),
            state,
            status: RunStatus::Completed,
            outcomes: vec![],
        }
    }

    #[test]
    fn test_writes_state_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let run = outcome(true);
        let files = write_run(dir.path(), &run).unwrap();

        let back: PipelineState =
            serde_json::from_str(&std::fs::read_to_string(&files.state).unwrap()).unwrap();
        assert_eq!(back, run.state);
        let report = std::fs::read_to_string(files.report.unwrap()).unwrap();
        assert!(report.starts_with("# Optics"));
    }

    #[test]
    fn test_no_report_file_without_report() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_run(dir.path(), &outcome(false)).unwrap();
        assert!(files.report.is_none());
        assert!(files.state.exists());
    }
}
