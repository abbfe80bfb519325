//! Config commands

use anyhow::Result;
use colored::Colorize;

use super::Context;
use crate::config::Config;
use crate::ConfigCommands;

pub fn handle(action: ConfigCommands, ctx: &Context) -> Result<()> {
    match action {
        ConfigCommands::Init => {
            let config = Config {
                state_path: Some(Config::default_state_path()?),
                default_format: Some("table".into()),
                billing: Some(Default::default()),
            };
            let path = config.save(ctx.profile.as_deref())?;
            println!("{} configuration initialized at {}", "✓".green().bold(), path.display());
        }
        ConfigCommands::Show => {
            let effective = Config {
                state_path: Some(ctx.state_path()?),
                default_format: ctx.config.default_format.clone(),
                billing: Some(ctx.config.billing()),
            };
            ctx.format.print(&effective)?;
            if let Some(billing) = &effective.billing {
                if ctx.format.is_table() {
                    ctx.format.print(billing)?;
                }
            }
        }
    }
    Ok(())
}
