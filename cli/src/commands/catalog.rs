//! Catalog commands

use anyhow::Result;
use colored::Colorize;

use hms_billing::CatalogBundle;

use super::{read_document, Context};
use crate::CatalogCommands;

pub fn handle(action: CatalogCommands, ctx: &Context) -> Result<()> {
    match action {
        CatalogCommands::Import { file } => {
            let bundle: CatalogBundle = read_document(&file)?;
            let session = ctx.session()?;
            let summary = session.platform.catalog.import(bundle)?;
            session.save()?;

            if ctx.format.is_table() {
                println!(
                    "{} imported {} tenants, {} plans, {} entities, {} rules, {} discount codes",
                    "✓".green().bold(),
                    summary.tenants,
                    summary.plans,
                    summary.entities,
                    summary.rules,
                    summary.discount_codes,
                );
            } else {
                ctx.format.print(&summary)?;
            }
        }
    }
    Ok(())
}
