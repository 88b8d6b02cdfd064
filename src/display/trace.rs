use crate::compute::RunOutput;
use crate::graph::Expr;
use crate::store::{Model, RefId, RefKind};
use std::collections::HashMap;
use std::fmt::Write;

/// Renders the dependency tree of `target` as an indented audit trace.
///
/// With a run output, every line carries the reference's final value for the
/// first sample. A reference already printed is shown as a back-pointer to the
/// level where it first appeared.
pub fn format_trace(model: &Model, output: Option<&RunOutput>, target: RefId) -> String {
    let mut tracer = Tracer { model, output, visited_at_level: HashMap::new(), output_text: String::new() };

    match model.get(target) {
        Some(r) => {
            let _ = writeln!(tracer.output_text, "AUDIT TRACE for reference '{}':", r.name());
            let _ = writeln!(tracer.output_text, "--------------------------------------------------");
            tracer.trace_ref(target, 1, "");
        }
        None => {
            let _ = writeln!(tracer.output_text, "Error: Invalid reference id {:?}", target);
        }
    }
    tracer.output_text
}

struct Tracer<'a> {
    model: &'a Model,
    output: Option<&'a RunOutput>,
    visited_at_level: HashMap<RefId, usize>,
    output_text: String,
}

impl<'a> Tracer<'a> {
    fn trace_ref(&mut self, id: RefId, level: usize, prefix: &str) {
        if let Some(&first_seen) = self.visited_at_level.get(&id) {
            let _ = writeln!(self.output_text, "{}-> (Ref to L{})", prefix, first_seen);
            return;
        }
        self.visited_at_level.insert(id, level);

        let Some(r) = self.model.get(id) else {
            let _ = writeln!(self.output_text, "{}[L{}] #{} -> (missing)", prefix, level, id.0);
            return;
        };
        let header = format!("[L{}] {}{}", level, r.name(), self.format_value(r.name()));

        match r.kind() {
            RefKind::Time => {
                let _ = writeln!(self.output_text, "{}{} -> Clock", prefix, header);
            }
            RefKind::Stock => {
                let mut formula = format!("{}.prev", r.name());
                for &flow in r.inflows() {
                    let _ = write!(formula, " + {}", self.format_parent_ref(flow));
                }
                for &flow in r.outflows() {
                    let _ = write!(formula, " - {}", self.format_parent_ref(flow));
                }
                let _ = writeln!(self.output_text, "{}{} = {}{}", prefix, header, formula, self.format_bounds(id));
                let flows: Vec<RefId> = r.inflows().iter().chain(r.outflows()).copied().collect();
                self.recurse_children(prefix, &flows, level);
            }
            _ => match r.equation() {
                Some(eq) => {
                    let reads = self.reads_of(id);
                    let rendered = self.model.render(eq);
                    if reads.is_empty() {
                        let _ = writeln!(self.output_text, "{}{} -> Var({}){}", prefix, header, rendered, self.format_bounds(id));
                    } else {
                        let _ = writeln!(self.output_text, "{}{} = {}{}", prefix, header, rendered, self.format_bounds(id));
                        self.recurse_children(prefix, &reads, level);
                    }
                }
                None => {
                    let bound = self
                        .output
                        .and_then(|o| o.bindings.get(r.name()))
                        .map(String::as_str)
                        .unwrap_or("unbound");
                    let _ = writeln!(self.output_text, "{}{} -> Bound({})", prefix, header, bound);
                }
            },
        }
    }

    fn recurse_children(&mut self, prefix: &str, children: &[RefId], level: usize) {
        let stem = self.build_child_stem(prefix);
        for (i, &child) in children.iter().enumerate() {
            let connector = if i == children.len() - 1 { "`--" } else { "|--" };
            let full_prefix = format!("{}{}", stem, connector);
            self.trace_ref(child, level + 1, &full_prefix);
        }
    }

    /// Distinct references read by any slot of `id`, in first-read order.
    fn reads_of(&self, id: RefId) -> Vec<RefId> {
        let mut reads = Vec::new();
        if let Some(r) = self.model.get(id) {
            for (_, expr) in r.slots() {
                for read in expr.reads() {
                    if read.id != id && !reads.contains(&read.id) {
                        reads.push(read.id);
                    }
                }
            }
        }
        reads
    }

    fn format_bounds(&self, id: RefId) -> String {
        let Some(r) = self.model.get(id) else { return String::new() };
        match (r.min(), r.max()) {
            (None, None) => String::new(),
            (min, max) => {
                let show = |e: Option<&Expr>| e.map(|e| self.model.render(e)).unwrap_or_else(|| "-".into());
                format!("  (clamped to [{}, {}])", show(min), show(max))
            }
        }
    }

    fn format_parent_ref(&self, id: RefId) -> String {
        let name = self.model.name_of(id);
        format!("{}{}", name, self.format_value(name))
    }

    fn format_value(&self, name: &str) -> String {
        let Some(output) = self.output else { return String::new() };
        match output.get(name) {
            Some(series) => {
                let last = output.steps.saturating_sub(1);
                let values = series.step(0, last);
                if values.len() == 1 {
                    format!("[{:.3}]", values[0])
                } else {
                    format!("[{:.3}, ...]", values[0])
                }
            }
            None if name == crate::store::TIME_NAME => format!("[{}]", output.steps.saturating_sub(1)),
            None => "[?]".to_string(),
        }
    }

    fn build_child_stem(&self, current_prefix: &str) -> String {
        current_prefix.replace("`--", "   ").replace("|--", "|  ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Bindings, RunConfig};
    use crate::store::RefSpec;

    fn shop() -> Model {
        let mut model = Model::new("shop");
        let price = model.variable("price", 2.0).unwrap();
        let units = model.free_variable("units").unwrap();
        let revenue = model.flow("revenue").unwrap();
        model.set_equation(revenue, price * units).unwrap();
        let cash = model.attach("cash", RefSpec::stock().init(0.0).max(100)).unwrap();
        model.connect_inflow(cash, revenue).unwrap();
        model.variable("double_price", price * 2).unwrap();
        model
    }

    #[test]
    fn test_trace_without_values() {
        let model = shop();
        let cash = model.id_of("cash").unwrap();
        let trace = format_trace(&model, None, cash);
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines[0], "AUDIT TRACE for reference 'cash':");
        assert_eq!(lines[2], "[L1] cash = cash.prev + revenue  (clamped to [-, Scalar(100)])");
        assert_eq!(lines[3], "`--[L2] revenue = (* price units)");
        assert_eq!(lines[4], "   |--[L3] price -> Var(Scalar(2.0))");
        assert_eq!(lines[5], "   `--[L3] units -> Bound(unbound)");
    }

    #[test]
    fn test_trace_with_run_values_and_back_references() {
        let mut model = shop();
        let price = model.id_of("price").unwrap();
        let double_price = model.id_of("double_price").unwrap();
        let both = model.variable("both", price + double_price).unwrap();
        let bindings = Bindings::new().with("units", 3.0);
        let output = model.run(&bindings, &RunConfig::new().steps(3)).unwrap().clone();

        let cash = model.id_of("cash").unwrap();
        let trace = format_trace(&model, Some(&output), cash);
        assert!(trace.contains("[L1] cash[12.000] = cash.prev + revenue[6.000]"), "{}", trace);
        assert!(trace.contains("units[3.000] -> Bound(Scalar(3.0))"), "{}", trace);

        let trace = format_trace(&model, Some(&output), both);
        assert!(trace.contains("|--[L2] price[2.000] -> Var(Scalar(2.0))"), "{}", trace);
        assert!(trace.contains("   `---> (Ref to L2)"), "{}", trace);
    }

    #[test]
    fn test_invalid_target() {
        let model = shop();
        assert!(format_trace(&model, None, RefId(999)).starts_with("Error: Invalid reference id"));
    }
}
