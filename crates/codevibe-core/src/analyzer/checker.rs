//! Rule matching over a parsed module.
//!
//! Two passes: [`AliasCollector`] records every import binding so that
//! `import os as o` / `from os import system as s` resolve to qualified
//! names, then [`RuleChecker`] walks the tree and consults the rule table.
//! Binding resolution ignores scope; a local name bound by any import
//! anywhere in the program resolves to every module it was bound to.

use std::collections::{BTreeSet, HashMap};

use super::ast::*;
use super::{CodeStats, Violation};
use crate::rules::{RuleTable, ViolationRule};

/// Prefixes that name the builtins namespace explicitly.
const BUILTIN_PREFIXES: &[&str] = &["builtins.", "__builtins__."];

pub(super) fn check(module: &Module, rules: &RuleTable, source: &str) -> (Vec<Violation>, CodeStats) {
    let mut aliases = AliasCollector::default();
    walk_module(&mut aliases, module);

    let mut checker = RuleChecker {
        rules,
        aliases: aliases.bindings,
        violations: Vec::new(),
        functions: 0,
        classes: 0,
        modules: BTreeSet::new(),
    };
    walk_module(&mut checker, module);

    let stats = CodeStats {
        lines: source.lines().count(),
        characters: source.chars().count(),
        functions: checker.functions,
        classes: checker.classes,
        imported_modules: checker.modules.into_iter().collect(),
    };
    (checker.violations, stats)
}

/// Strip `builtins.` / `__builtins__.` so `builtins.eval` matches `eval`.
fn normalize(mut name: String) -> String {
    while let Some(prefix) = BUILTIN_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        name.replace_range(..prefix.len(), "");
    }
    name
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

// ---------------------------------------------------------------------------
// Import bindings
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AliasCollector {
    bindings: HashMap<String, Vec<String>>,
}

impl AliasCollector {
    fn bind(&mut self, local: &str, target: String) {
        let targets = self.bindings.entry(local.to_owned()).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
}

impl Visitor for AliasCollector {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for alias in names {
                    match &alias.asname {
                        Some(local) => self.bind(local, alias.name.clone()),
                        None => {
                            let head = alias.name.split('.').next().unwrap_or(&alias.name);
                            self.bind(head, head.to_owned());
                        }
                    }
                }
            }
            StmtKind::ImportFrom {
                module: Some(module),
                level: 0,
                names,
            } => {
                for alias in names.iter().filter(|a| a.name != "*") {
                    let local = alias.asname.as_deref().unwrap_or(&alias.name);
                    self.bind(local, format!("{module}.{}", alias.name));
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }
}

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

struct RuleChecker<'a> {
    rules: &'a RuleTable,
    aliases: HashMap<String, Vec<String>>,
    violations: Vec<Violation>,
    functions: usize,
    classes: usize,
    modules: BTreeSet<String>,
}

impl RuleChecker<'_> {
    fn report(&mut self, rule: &ViolationRule, location: Location, subject: &str) {
        self.violations.push(Violation {
            rule: rule.id.clone(),
            kind: Some(rule.kind),
            category: rule.category,
            severity: rule.severity,
            location,
            message: format!("{subject}: {}", rule.message),
        });
    }

    /// Every qualified name a local name may stand for, itself included.
    fn resolve_name(&self, name: &str) -> Vec<String> {
        let mut names = vec![normalize(name.to_owned())];
        if let Some(targets) = self.aliases.get(name) {
            for target in targets {
                let target = normalize(target.clone());
                if !names.contains(&target) {
                    names.push(target);
                }
            }
        }
        names
    }

    /// Qualified names of a `Name` / `a.b.c` expression; empty otherwise.
    fn qualified_names(&self, expr: &Expr) -> Vec<String> {
        match &expr.kind {
            ExprKind::Name(name) => self.resolve_name(name),
            ExprKind::Attribute { value, attr } => self
                .qualified_names(value)
                .into_iter()
                .map(|base| normalize(format!("{base}.{attr}")))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn check_import(&mut self, module: &str, location: Location) -> bool {
        let rules = self.rules;
        match rules.match_import(module) {
            Some(rule) => {
                self.report(rule, location, module);
                true
            }
            None => false,
        }
    }

    fn check_dynamic_eval(&mut self, expr: &Expr, subject: &str) {
        let rules = self.rules;
        for name in self.qualified_names(expr) {
            if let Some(rule) = rules.match_dynamic_eval(&name) {
                self.report(rule, expr.loc, subject);
            }
        }
    }

    /// Call rules apply to any reference to the callable, not only to the
    /// call site: `o = open` or `[open][0]` reach the same function. A
    /// callee shares its call's location, so a direct call reports once.
    fn check_callable(&mut self, expr: &Expr) {
        let rules = self.rules;
        for name in self.qualified_names(expr) {
            if let Some(rule) = rules.match_call(&name) {
                self.report(rule, expr.loc, &name);
            }
        }
    }
}

impl Visitor for RuleChecker<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for alias in names {
                    self.modules.insert(alias.name.clone());
                    self.check_import(&alias.name, alias.loc);
                }
            }
            StmtKind::ImportFrom {
                module: Some(module),
                level: 0,
                names,
            } => {
                self.modules.insert(module.clone());
                if !self.check_import(module, stmt.loc) {
                    // `from xml import etree` style: the submodule may be
                    // listed even when the package is not.
                    for alias in names.iter().filter(|a| a.name != "*") {
                        self.check_import(&format!("{module}.{}", alias.name), alias.loc);
                    }
                }
            }
            StmtKind::FunctionDef { .. } => self.functions += 1,
            StmtKind::ClassDef { .. } => self.classes += 1,
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        let rules = self.rules;
        match &expr.kind {
            ExprKind::Name(name) => {
                if is_dunder(name) {
                    if let Some(rule) = rules.match_attribute(name) {
                        self.report(rule, expr.loc, name);
                    }
                }
                self.check_dynamic_eval(expr, name);
                self.check_callable(expr);
            }
            ExprKind::Attribute { attr, .. } => {
                if let Some(rule) = rules.match_attribute(attr) {
                    self.report(rule, expr.loc, attr);
                }
                self.check_dynamic_eval(expr, attr);
                self.check_callable(expr);
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parser::parse_module;

    fn ids(source: &str) -> Vec<String> {
        let table = RuleTable::builtin().unwrap();
        let module = parse_module(source).unwrap();
        let (violations, _) = check(&module, &table, source);
        violations.into_iter().map(|v| v.rule).collect()
    }

    #[test]
    fn test_normalize_strips_builtin_prefixes() {
        assert_eq!(normalize("builtins.eval".into()), "eval");
        assert_eq!(normalize("__builtins__.exec".into()), "exec");
        assert_eq!(normalize("builtins.__builtins__.open".into()), "open");
        assert_eq!(normalize("math.sqrt".into()), "math.sqrt");
    }

    #[test]
    fn test_aliased_call_resolves() {
        let found = ids("import subprocess as sp\nsp.run(['ls'])\n");
        assert!(found.contains(&"import.subprocess".to_string()));
        assert!(found.contains(&"call.subprocess.run".to_string()));
    }

    #[test]
    fn test_from_import_alias_resolves() {
        let found = ids("from os import system as s\ns('ls')\n");
        assert!(found.contains(&"call.os.system".to_string()));
    }

    #[test]
    fn test_eval_reference_without_call() {
        let found = ids("f = eval\nf('1')\n");
        assert_eq!(found, vec!["dynamic_eval.eval".to_string()]);
    }

    #[test]
    fn test_rebound_builtin_is_flagged() {
        assert_eq!(ids("o = open\no('/etc/passwd')\n"), vec!["call.open".to_string()]);
        assert_eq!(ids("g = getattr\n"), vec!["call.getattr".to_string()]);
        assert_eq!(ids("[open][0]('x')\n"), vec!["call.open".to_string()]);
    }

    #[test]
    fn test_direct_call_reports_once() {
        assert_eq!(ids("open('x')\n"), vec!["call.open".to_string()]);
        let found = ids("import os\nf = os.system\n");
        assert_eq!(found, vec!["import.os".to_string(), "call.os.system".to_string()]);
    }

    #[test]
    fn test_builtins_namespace_eval() {
        let found = ids("x = __builtins__.eval\n");
        assert!(found.contains(&"attribute.__builtins__".to_string()));
        assert!(found.contains(&"dynamic_eval.eval".to_string()));
    }

    #[test]
    fn test_model_eval_method_is_not_dynamic_eval() {
        assert!(ids("model.eval()\nre.compile('x')\n").is_empty());
    }

    #[test]
    fn test_dunder_attribute_chain() {
        let found = ids("().__class__.__bases__[0].__subclasses__()\n");
        assert!(found.contains(&"attribute.__bases__".to_string()));
        assert!(found.contains(&"attribute.__subclasses__".to_string()));
    }

    #[test]
    fn test_fstring_field_is_checked() {
        let found = ids("print(f\"{open('x').read()}\")\n");
        assert_eq!(found, vec!["call.open".to_string()]);
    }

    #[test]
    fn test_stats_counted() {
        let source = "import math\nfrom collections import deque\n\ndef f():\n    pass\n\nclass A:\n    def g(self):\n        pass\n";
        let table = RuleTable::builtin().unwrap();
        let module = parse_module(source).unwrap();
        let (violations, stats) = check(&module, &table, source);
        assert!(violations.is_empty());
        assert_eq!(stats.lines, 9);
        assert_eq!(stats.functions, 2);
        assert_eq!(stats.classes, 1);
        assert_eq!(stats.imported_modules, vec!["collections", "math"]);
    }
}
