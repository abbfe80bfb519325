//! Output formatting

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::str::FromStr;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// One field of a record shown as a table
#[derive(Tabled)]
struct Field {
    field: String,
    value: String,
}

fn scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "-".into(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl OutputFormat {
    /// Print one record; tables show its top-level fields
    pub fn print<T: Serialize>(&self, data: &T) -> Result<()> {
        match self {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
            OutputFormat::Table => {
                let rows: Vec<Field> = match serde_json::to_value(data)? {
                    serde_json::Value::Object(map) => map
                        .iter()
                        .filter(|(_, v)| !v.is_array() && !v.is_object())
                        .map(|(k, v)| Field { field: k.clone(), value: scalar(v) })
                        .collect(),
                    other => vec![Field { field: "value".into(), value: scalar(&other) }],
                };
                println!("{}", Table::new(rows));
            }
        }
        Ok(())
    }

    /// Print a list; `rows` is the table view, `data` the structured one
    pub fn print_list<T: Serialize, R: Tabled>(&self, data: &[T], rows: Vec<R>) -> Result<()> {
        match self {
            OutputFormat::Table => {
                if rows.is_empty() {
                    println!("(none)");
                } else {
                    println!("{}", Table::new(rows));
                }
                Ok(())
            }
            _ => self.print(&data),
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}
