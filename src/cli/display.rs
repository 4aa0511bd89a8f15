use console::{style, Style};

use crate::backlog::{Backlog, TaskStatus};
use crate::scheduler::RunSummary;

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_backlog_detail(&self, backlog: &Backlog) {
        self.print_header(&format!("Track: {}", backlog.track_id));

        let total = backlog.tasks.len();
        let completed = backlog
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let pct = if total == 0 {
            0
        } else {
            (completed * 100 / total) as u8
        };

        println!(
            "Progress: {} {}% ({}/{})",
            self.progress_bar(pct, 30),
            pct,
            completed,
            total
        );
        println!();

        for task in &backlog.tasks {
            let status_style = self.status_style(task.status);
            println!(
                "{:<8} {:<40} {:<12} {}",
                style(&task.id).bold(),
                truncate(&task.title, 38),
                status_style.apply_to(task.status.to_string()),
                if task.attempts > 1 {
                    format!("attempts: {}", task.attempts)
                } else {
                    String::new()
                }
            );
            if let Some(err) = &task.last_error {
                println!("         {}", style(truncate(err, 70)).red().dim());
            }
        }
        println!();
    }

    pub fn print_tracks_table(&self, tracks: &[(String, Option<Backlog>)]) {
        if tracks.is_empty() {
            println!("{}", style("No tracks found.").dim());
            return;
        }

        println!(
            "{:<10} {:<10} {:<30}",
            style("Track").bold(),
            style("Tasks").bold(),
            style("Status").bold()
        );
        println!("{}", style("─".repeat(52)).dim());

        for (track_id, backlog) in tracks {
            match backlog {
                Some(b) => {
                    let counts = b.counts();
                    let done = counts.get(&TaskStatus::Completed).copied().unwrap_or(0);
                    let status = if b.all_terminal() {
                        style("finished").green()
                    } else {
                        style("open").yellow()
                    };
                    println!(
                        "{:<10} {:<10} {:<30}",
                        track_id,
                        format!("{}/{}", done, b.tasks.len()),
                        status
                    );
                }
                None => {
                    println!("{:<10} {:<10} {:<30}", track_id, "-", style("planned").dim());
                }
            }
        }
    }

    pub fn print_run_summary(&self, summary: &RunSummary) {
        println!();
        println!(
            "Completed: {}  Failed: {}  Review: {}  Total: {}",
            style(summary.completed).green(),
            style(summary.failed).red(),
            style(summary.review).yellow(),
            summary.total
        );
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    fn status_style(&self, status: TaskStatus) -> Style {
        match status {
            TaskStatus::Pending => Style::new().dim(),
            TaskStatus::Ready => Style::new().blue(),
            TaskStatus::InProgress => Style::new().yellow().bold(),
            TaskStatus::Rebasing => Style::new().magenta(),
            TaskStatus::Review => Style::new().yellow().underlined(),
            TaskStatus::Completed => Style::new().green(),
            TaskStatus::Failed => Style::new().red().bold(),
        }
    }

    fn progress_bar(&self, percentage: u8, width: usize) -> String {
        let filled = (width as f64 * percentage as f64 / 100.0) as usize;
        let empty = width - filled;

        format!(
            "{}{}",
            style("█".repeat(filled)).green(),
            style("░".repeat(empty)).dim()
        )
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
