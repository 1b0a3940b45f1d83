use std::io::{self, Write};

use runsnake_core::model::MemoryTree;
use runsnake_protocol::{NodeSnapshot, TreeSnapshot, ValueUnit};

const INDENT: usize = 2;

/// Print `snapshot` one node per line, children indented under their
/// parent: value, share of the root, local value, label.
pub fn write_outline(out: &mut impl Write, snapshot: &TreeSnapshot) -> io::Result<()> {
    let unit = snapshot.unit;
    let total = snapshot.root.value;
    writeln!(out, "{:>12} {:>8} {:>12}  name", "total", "share", "local")?;

    let mut stack: Vec<(&NodeSnapshot, usize)> = vec![(&snapshot.root, 0)];
    while let Some((node, depth)) = stack.pop() {
        write_node(out, unit, total, node, depth)?;
        stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
    }
    Ok(())
}

fn write_node(
    out: &mut impl Write,
    unit: ValueUnit,
    total: f64,
    node: &NodeSnapshot,
    depth: usize,
) -> io::Result<()> {
    let marker = if node.truncated { " …" } else { "" };
    writeln!(
        out,
        "{:>12} {:>8} {:>12}  {:indent$}{}{marker}",
        unit.format_value(node.value),
        unit.format_share(node.value, total),
        unit.format_value(node.local),
        "",
        node.label,
        indent = depth * INDENT,
    )
}

/// Print the per-type totals of the records a dump was built from.
pub fn write_type_summary(out: &mut impl Write, tree: &MemoryTree) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{:>12} {:>10}  type", "bytes", "count")?;
    for summary in tree.type_summary() {
        writeln!(
            out,
            "{:>12} {:>10}  {}",
            ValueUnit::Bytes.format_value(summary.bytes as f64),
            summary.count,
            summary.type_name
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(label: &str, value: f64, children: Vec<NodeSnapshot>) -> NodeSnapshot {
        NodeSnapshot {
            label: label.into(),
            cumulative: value,
            local: 0.0,
            value,
            children,
            truncated: false,
        }
    }

    #[test]
    fn outline_indents_children() {
        let mut leaf = node("leaf", 25.0, Vec::new());
        leaf.truncated = true;
        let snapshot = TreeSnapshot {
            unit: ValueUnit::Weight,
            root: node("root", 100.0, vec![node("a", 75.0, vec![leaf]), node("b", 25.0, Vec::new())]),
        };

        let mut out = Vec::new();
        write_outline(&mut out, &snapshot).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[1].ends_with("  root"));
        assert!(lines[2].ends_with("    a"));
        assert!(lines[2].contains("75.00%"));
        assert!(lines[3].ends_with("      leaf …"));
        assert!(lines[4].ends_with("    b"));
    }
}
