use crate::pipeline::{Pipeline, StepReport, StepState};
use chrono_humanize::{Accuracy, HumanTime, Tense};
use colored::Colorize;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{error, println, success};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Machine readable form of a finished run, for CI systems that archive it.
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    id: &'a str,
    succeeded: bool,
    steps: Vec<StepEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct StepEntry<'a> {
    name: &'a str,
    state: StepState,
    attempts: u32,
    elapsed_ms: u128,
}

fn run_report(pipeline: &Pipeline, succeeded: bool) -> RunReport<'_> {
    RunReport {
        id: &pipeline.id,
        succeeded,
        steps: pipeline
            .report()
            .iter()
            .map(|step| StepEntry {
                name: &step.name,
                state: step.state,
                attempts: step.attempts,
                elapsed_ms: step.elapsed.as_millis(),
            })
            .collect(),
    }
}

fn state_color(state: StepState) -> Color {
    match state {
        StepState::Complete => Color::Green,
        StepState::Failed => Color::Red,
    }
}

/// Transforms an elapsed step time into a humanized duration string (i.e. '3 minutes and 5 seconds').
fn humanize_duration(elapsed: Duration) -> String {
    let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
    HumanTime::from(chrono::Duration::milliseconds(millis))
        .to_text_en(Accuracy::Precise, Tense::Present)
}

pub fn table(steps: &[StepReport]) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table
        .load_preset(ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("step")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("state")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("attempts")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("duration")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
        ]);

    for step in steps {
        table.add_row(vec![
            Cell::new(&step.name).fg(Color::Green),
            Cell::new(step.state).fg(state_color(step.state)),
            Cell::new(step.attempts),
            Cell::new(humanize_duration(step.elapsed)),
        ]);
    }

    table
}

/// Prints the step table followed by a one line verdict for the run.
pub fn print(pipeline: &Pipeline, succeeded: bool) {
    if pipeline.report().is_empty() {
        return;
    }

    let total: Duration = pipeline.report().iter().map(|step| step.elapsed).sum();

    println!("{}", table(pipeline.report()));
    if succeeded {
        success!(
            "Run {} completed in {}",
            pipeline.id.bold(),
            humanize_duration(total)
        );
    } else {
        error!(
            "Run {} failed in {}",
            pipeline.id.bold(),
            humanize_duration(total)
        );
    }
}

pub async fn write_json(pipeline: &Pipeline, succeeded: bool, path: &Path) -> anyhow::Result<()> {
    let content = serde_json::to_vec_pretty(&run_report(pipeline, succeeded))?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
