use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

pub trait OutputFormatter {
    fn format<T: Serialize>(&self, data: T) -> String;
    fn format_table<T: Tabled + Serialize>(&self, data: Vec<T>) -> String;
}

fn encode<T: Serialize>(format: OutputFormat, data: &T) -> String {
    let encoded = match format {
        OutputFormat::Yaml => serde_yaml::to_string(data).map_err(|e| e.to_string()),
        OutputFormat::Table | OutputFormat::Json => {
            serde_json::to_string_pretty(data).map_err(|e| e.to_string())
        }
    };
    encoded.unwrap_or_else(|e| format!("cannot encode output: {e}"))
}

impl OutputFormatter for OutputFormat {
    fn format<T: Serialize>(&self, data: T) -> String {
        encode(*self, &data)
    }

    fn format_table<T: Tabled + Serialize>(&self, data: Vec<T>) -> String {
        match self {
            OutputFormat::Table if data.is_empty() => "Nothing found".dimmed().to_string(),
            OutputFormat::Table => Table::new(data).with(Style::rounded()).to_string(),
            _ => encode(*self, &data),
        }
    }
}

impl OutputFormat {
    /// Status lines only make sense next to a human-readable table.
    pub fn is_human(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "•".blue(), message);
}

pub fn print_progress(message: &str) {
    eprintln!("{} {}", "…".cyan(), message.dimmed());
}
