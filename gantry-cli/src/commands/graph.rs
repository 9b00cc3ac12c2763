//! Transition table printer

use anyhow::{Context, Result};
use colored::*;
use gantry_core::TransitionGraph;

pub fn print_graph() -> Result<()> {
    let graph = TransitionGraph::standard();
    graph.validate().context("Transition graph is inconsistent")?;

    println!("{}", "Job status transitions:".bold());
    println!();
    for transition in graph.transitions() {
        let hook = transition
            .hook
            .map(|hook| format!(" [{:?}]", hook))
            .unwrap_or_default();
        println!(
            "  {} -> {} {}{}",
            format!("{:<11}", transition.from.as_str()).cyan(),
            format!("{:<11}", transition.to.as_str()).cyan(),
            transition.cause,
            hook.dimmed()
        );
    }

    Ok(())
}
