//! Credit network simulator
//!
//! Starts every node of a scenario on one in-process bus, sets up channels,
//! lines, rates and commissions, then runs the scenario's payments and
//! prints the resulting balances. With `CREDITNET_REPORT=json` the lines and
//! transactions of every node are printed as one JSON document instead.

use anyhow::{bail, Context, Result};
use line_ledger::{Equivalent, NodeId};
use message_bus::{Bus, BusConfig};
use observing_ledger::{ObservingConfig, ObservingLedger};
use line_ledger::LineView;
use payment_engine::{Config, Node, ProtocolMessage, RateInput, TransactionView};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Deserialize)]
struct Scenario {
    data_dir: PathBuf,
    #[serde(default)]
    observing: ObservingConfig,
    nodes: Vec<String>,
    #[serde(default)]
    lines: Vec<LineSpec>,
    #[serde(default)]
    rates: Vec<RateSpec>,
    #[serde(default)]
    commissions: Vec<CommissionSpec>,
    #[serde(default)]
    payments: Vec<PaymentSpec>,
}

/// `from` extends `amount` of trust to `to`
#[derive(Debug, Deserialize)]
struct LineSpec {
    from: String,
    to: String,
    equivalent: u32,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct RateSpec {
    node: String,
    from: u32,
    to: u32,
    rate: String,
}

#[derive(Debug, Deserialize)]
struct CommissionSpec {
    node: String,
    equivalent: u32,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct PaymentSpec {
    from: String,
    to: String,
    send: u32,
    receive: u32,
    amount: Decimal,
    max_allowable: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    lines: Vec<LineView>,
    transactions: Vec<TransactionView>,
}

fn lookup<'a>(nodes: &'a BTreeMap<String, Node>, id: &str) -> Result<&'a Node> {
    match nodes.get(id) {
        Some(node) => Ok(node),
        None => bail!("unknown node {}", id),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CREDITNET_SCENARIO").ok())
        .context("usage: creditnet-node <scenario.toml> (or set CREDITNET_SCENARIO)")?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let scenario: Scenario = toml::from_str(&text).with_context(|| format!("parsing {}", path))?;
    info!(scenario = %path, nodes = scenario.nodes.len(), "Loading scenario");

    let bus: Arc<Bus<ProtocolMessage>> = Arc::new(Bus::new(BusConfig::default()));
    let observing = Arc::new(ObservingLedger::new(scenario.observing.clone()));

    let mut nodes = BTreeMap::new();
    for id in &scenario.nodes {
        let config = Config::for_node(id.clone(), scenario.data_dir.join(id));
        let node = Node::start(config, bus.clone(), observing.clone())
            .await
            .with_context(|| format!("starting {}", id))?;
        nodes.insert(id.clone(), node);
    }
    let node = |id: &str| lookup(&nodes, id);

    for line in &scenario.lines {
        let from = node(&line.from)?;
        let to = NodeId::new(line.to.clone());
        from.open_channel(&to).await?;
        from.set_settlement_line(&to, Equivalent::new(line.equivalent), line.amount)
            .await
            .with_context(|| format!("line {} -> {}", line.from, line.to))?;
    }
    for rate in &scenario.rates {
        node(&rate.node)?.set_exchange_rate(
            Equivalent::new(rate.from),
            Equivalent::new(rate.to),
            RateInput::Real(rate.rate.clone()),
            None,
            None,
        )?;
    }
    for commission in &scenario.commissions {
        node(&commission.node)?
            .set_commission(Equivalent::new(commission.equivalent), commission.amount)?;
    }

    for payment in &scenario.payments {
        let sender = node(&payment.from)?;
        let receiver = NodeId::new(payment.to.clone());
        let result = sender
            .create_exchange_transaction(
                &receiver,
                Equivalent::new(payment.send),
                payment.amount,
                Equivalent::new(payment.receive),
                payment.max_allowable,
            )
            .await;
        match result {
            Ok(transaction) => {
                let view = sender.transaction(transaction)?;
                info!(
                    %transaction,
                    from = %payment.from,
                    to = %payment.to,
                    paid = ?view.paid,
                    delivered = ?view.delivered,
                    "Payment committed"
                );
            }
            Err(e) => error!(from = %payment.from, to = %payment.to, error = %e, "Payment failed"),
        }
    }

    if std::env::var("CREDITNET_REPORT").as_deref() == Ok("json") {
        let mut report = BTreeMap::new();
        for (id, node) in &nodes {
            report.insert(
                id.clone(),
                NodeReport {
                    lines: node.list_lines()?,
                    transactions: node.transactions()?,
                },
            );
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (id, node) in &nodes {
            for line in node.list_lines()? {
                println!(
                    "{:<12} {:<12} eq:{:<6} balance {:>14}  out {:>14}  in {:>14}",
                    id,
                    line.neighbor,
                    line.equivalent.id(),
                    line.balance,
                    line.available_outgoing,
                    line.available_incoming
                );
            }
        }
    }

    for node in nodes.values() {
        node.terminate().await;
    }
    Ok(())
}
