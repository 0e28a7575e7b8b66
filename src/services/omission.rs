//! Module omission for patch targeting.
//!
//! To compile sources the same way a player build would, the server must skip
//! modules that aren't part of the selected player build: editor-only and test
//! modules, plus modules whose define constraints fail for the active symbols.

use crate::models::{ALWAYS_INCLUDED_MODULE, ActiveDefines, Module};
use crate::services::constraints::ConstraintEvaluator;
use std::collections::HashSet;

/// Computes the set of module names excluded from patch targeting.
///
/// Read-only and cacheable; caching and invalidation (on module add/remove/move)
/// belong to the caller.
#[derive(Debug, Clone, Default)]
pub struct ModuleOmissionResolver {
    evaluator: ConstraintEvaluator,
}

impl ModuleOmissionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_evaluator(evaluator: ConstraintEvaluator) -> Self {
        Self { evaluator }
    }

    /// Compute the omission set.
    ///
    /// 1. Start from the editor modules, minus [`ALWAYS_INCLUDED_MODULE`].
    /// 2. Add every catalog module (editor and player) with a failing define constraint.
    /// 3. Remove every player module, even when step 2 flagged it.
    pub fn compute_omitted(
        &self,
        editor_modules: &[Module],
        player_modules: &[Module],
        defines: &ActiveDefines,
    ) -> HashSet<String> {
        let mut omitted: HashSet<String> = editor_modules
            .iter()
            .filter(|m| m.name != ALWAYS_INCLUDED_MODULE)
            .map(|m| m.name.clone())
            .collect();

        let catalog = editor_modules.iter().chain(player_modules);
        omitted.extend(
            catalog
                .filter(|m| self.fails_constraints(m, defines))
                .map(|m| m.name.clone()),
        );

        for module in player_modules {
            omitted.remove(&module.name);
        }

        omitted
    }

    /// Whether a module has at least one failing define constraint.
    ///
    /// Modules without constraints never fail. Malformed constraints fail open
    /// (the module is kept) so a typo can't hide a valid module.
    pub fn fails_constraints(&self, module: &Module, defines: &ActiveDefines) -> bool {
        if module.define_constraints.is_empty() {
            return false;
        }

        match self.evaluator.evaluate_all(&module.define_constraints, defines) {
            Ok(all_pass) => !all_pass,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed define constraint on module {}: {}",
                    module.name,
                    e
                );
                false
            }
        }
    }
}
