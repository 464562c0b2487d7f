//! Output formatting

use clap::ValueEnum;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn print<T: Serialize>(&self, data: &T) {
        match self {
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(data).unwrap_or_default());
            }
            OutputFormat::Json | OutputFormat::Table => {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
        }
    }

    /// Print rows, as a table unless a structured format was asked for
    pub fn print_rows<T: Serialize + Tabled>(&self, rows: &[T]) {
        match self {
            OutputFormat::Table => println!("{}", render_table(rows)),
            _ => self.print(&rows),
        }
    }
}

fn render_table<T: Tabled>(rows: &[T]) -> String {
    Table::new(rows).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Tabled)]
    struct Row {
        id: String,
        result: String,
    }

    #[test]
    fn test_table_has_header_and_rows() {
        let rendered = render_table(&[Row { id: "1".into(), result: "Configurations are added.".into() }]);
        assert!(rendered.contains("id"));
        assert!(rendered.contains("Configurations are added."));
    }
}
