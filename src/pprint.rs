use std::collections::HashSet;

use prettytable::{self, format, row};

use crate::hlo::{Computation, NodeId};
use crate::utils::join_into_string;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PrintMode {
    /// Every live node, with its users.
    Full,
    /// Only nodes reachable from the root.
    Compact,
}

/// Lays out `computation` as a table with one row per node, operands first.
pub fn graph_table(computation: &Computation, mode: PrintMode) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    match mode {
        PrintMode::Full => table.set_titles(row!["", "Shape", "Op", "Operands", "Users"]),
        PrintMode::Compact => table.set_titles(row!["", "Shape", "Op", "Operands"]),
    }

    let reachable = match mode {
        PrintMode::Full => None,
        PrintMode::Compact => Some(reachable_from_root(computation)),
    };
    for id in computation.post_order() {
        if let Some(reachable) = &reachable {
            if !reachable.contains(&id) {
                continue;
            }
        }
        let node = &computation[id];
        let name = if computation.is_root(id) {
            format!("{id} (root)")
        } else {
            id.to_string()
        };
        let operands = join_into_string(node.operands(), ", ");
        match mode {
            PrintMode::Full => table.add_row(row![
                name,
                node.shape(),
                node.op(),
                operands,
                join_into_string(node.users(), ", ")
            ]),
            PrintMode::Compact => table.add_row(row![name, node.shape(), node.op(), operands]),
        };
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

pub fn pprint(computation: &Computation, mode: PrintMode) {
    println!("{}:", computation.name());
    graph_table(computation, mode).printstd();
}

fn reachable_from_root(computation: &Computation) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack = computation.root().into_iter().collect::<Vec<_>>();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(computation.operands(id).iter().copied());
        }
    }
    seen
}
