//! Invoice commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;
use uuid::Uuid;

use hms_billing::invoicing::InvoiceLineItem;
use hms_billing::{GenerateInvoice, Invoice};

use super::Context;
use crate::InvoiceCommands;

#[derive(Tabled)]
struct LineRow {
    description: String,
    quantity: String,
    unit_price: String,
    amount: String,
}

impl From<&InvoiceLineItem> for LineRow {
    fn from(item: &InvoiceLineItem) -> Self {
        let quantity = match item.metered_units {
            Some(units) => format!("{} ({} units)", item.quantity, units),
            None => item.quantity.to_string(),
        };
        Self {
            description: item.description.clone(),
            quantity,
            unit_price: item.unit_price.to_string(),
            amount: item.amount.to_string(),
        }
    }
}

#[derive(Tabled)]
struct InvoiceRow {
    id: Uuid,
    number: String,
    status: &'static str,
    period: String,
    total: String,
    due: String,
}

impl From<&Invoice> for InvoiceRow {
    fn from(inv: &Invoice) -> Self {
        Self {
            id: inv.id,
            number: inv.number.clone(),
            status: inv.status.as_str(),
            period: format!("{} .. {}", inv.period_start.date_naive(), inv.period_end.date_naive()),
            total: format!("{} {}", inv.total, inv.currency),
            due: inv.due_date.date_naive().to_string(),
        }
    }
}

fn show(invoice: &Invoice, ctx: &Context) -> Result<()> {
    if !ctx.format.is_table() {
        return ctx.format.print(invoice);
    }
    println!(
        "{} {} ({})",
        "Invoice".bold(),
        invoice.number,
        invoice.status.as_str()
    );
    let rows = invoice.line_items.iter().map(LineRow::from).collect();
    ctx.format.print_list(&invoice.line_items, rows)?;
    println!("Subtotal  {}", invoice.subtotal);
    if let Some(code) = &invoice.discount_code {
        println!("Discount  -{} ({})", invoice.discount, code);
    }
    println!("Tax       {}", invoice.tax);
    println!("{}     {} {}", "Total".bold(), invoice.total, invoice.currency);
    Ok(())
}

pub fn handle(action: InvoiceCommands, ctx: &Context) -> Result<()> {
    let session = ctx.session()?;
    let platform = &session.platform;

    match action {
        InvoiceCommands::Generate { subscription, from, to, discount } => {
            let sub = platform.subscriptions.get(subscription)?;
            let mut request = GenerateInvoice::new(
                subscription,
                from.unwrap_or(sub.current_period_start),
                to.unwrap_or(sub.current_period_end),
            );
            if let Some(code) = discount.as_deref() {
                request = request.with_discount(code);
            }
            let invoice = platform.generate_invoice(request)?;
            session.save()?;
            show(&invoice, ctx)?;
        }
        InvoiceCommands::Finalize { id } => {
            let invoice = platform.invoicing.finalize(id)?;
            session.save()?;
            println!("{} {} sent, due {}", "✓".green().bold(), invoice.number, invoice.due_date.date_naive());
        }
        InvoiceCommands::Pay { id } => {
            let invoice = platform.invoicing.mark_paid(id)?;
            session.save()?;
            println!("{} {} paid", "✓".green().bold(), invoice.number);
        }
        InvoiceCommands::Cancel { id } => {
            let invoice = platform.invoicing.cancel(id)?;
            session.save()?;
            println!("{} {} cancelled", "✓".green().bold(), invoice.number);
        }
        InvoiceCommands::Show { id } => {
            show(&platform.invoicing.get(id)?, ctx)?;
        }
        InvoiceCommands::List { subscription } => {
            let invoices = platform.invoicing.for_subscription(subscription)?;
            let rows = invoices.iter().map(InvoiceRow::from).collect();
            ctx.format.print_list(&invoices, rows)?;
        }
    }
    Ok(())
}
