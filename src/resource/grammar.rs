//! Grammar resource

use anyhow::{Context, Result};
use convergence::{Error, Expected, RetryPolicy, Subject};
use cxapi::{Grammar, GrammarDraft};
use std::collections::BTreeSet;

use super::{ApplyContext, ApplyResult, Catalog, Drift, Resource, ResourceState, Tier, shown};
use crate::manifest::GrammarSpec;

/// An Architect grammar and the language codes it is defined for
#[derive(Debug, Clone)]
pub struct GrammarResource {
    pub spec: GrammarSpec,
}

impl GrammarResource {
    pub fn new(spec: GrammarSpec) -> Self {
        Self { spec }
    }

    fn fetch(&self, ctx: &ApplyContext) -> convergence::Result<Option<Grammar>> {
        let name = &self.spec.name;
        let id = match ctx.ledger.get(&self.id()) {
            Some(id) => Some(id),
            None => ctx
                .catalogs
                .ids(ctx.api, Catalog::Grammars)
                .map_err(|err| Error::api("list grammars", name, err))?
                .get(name)
                .cloned(),
        };
        let Some(id) = id else {
            return Ok(None);
        };

        match ctx.api.get_grammar(&id) {
            Ok(grammar) => Ok(Some(grammar)),
            Err(err) if err.is_not_found() => {
                ctx.ledger.forget(&self.id());
                Ok(None)
            }
            Err(err) => Err(Error::api("read", name, err)),
        }
    }

    fn draft(&self) -> GrammarDraft {
        GrammarDraft {
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
        }
    }

    fn verify(
        &self,
        ctx: &ApplyContext,
        id: &str,
        expected: &Expected,
    ) -> convergence::Result<Grammar> {
        ctx.engine
            .checker()
            .verify(&self.spec.name, id, expected, |id| ctx.api.get_grammar(id))
    }

    fn converge_languages(
        &self,
        ctx: &ApplyContext,
        grammar: &Grammar,
    ) -> convergence::Result<bool> {
        let name = &self.spec.name;
        let plan = ctx
            .engine
            .reconciler(None)
            .plan_members(&self.spec.languages, &grammar.language_codes());
        if plan.is_noop() {
            return Ok(false);
        }

        for language in &plan.to_add {
            // A conflict means the language is already defined
            ctx.engine.read_retry().run_remote(
                &Subject::new(format!("add language {language}"), name),
                RetryPolicy::ReadAfterWrite,
                || match ctx.api.add_grammar_language(&grammar.id, language) {
                    Err(err) if err.is_conflict() => Ok(()),
                    other => other.map(|_| ()),
                },
            )?;
        }
        for language in &plan.to_remove {
            if let Err(err) = ctx.api.delete_grammar_language(&grammar.id, language)
                && !err.is_not_found()
            {
                return Err(Error::api(format!("remove language {language}"), name, err));
            }
        }

        let expected = Expected::new().field("languages", self.spec.languages.clone());
        self.verify(ctx, &grammar.id, &expected)?;
        Ok(true)
    }

    fn apply_grammar(&self, ctx: &ApplyContext) -> convergence::Result<ApplyResult> {
        let name = &self.spec.name;
        let expected = Expected::new()
            .field("name", name.as_str())
            .field("description", self.spec.description.as_deref());

        let (grammar, mut result) = match self.fetch(ctx)? {
            None => {
                let created = ctx
                    .api
                    .create_grammar(&self.draft())
                    .map_err(|err| Error::api("create", name, err))?;
                ctx.ledger.record(&self.id(), &created.id);
                ctx.catalogs.invalidate(Catalog::Grammars);
                (self.verify(ctx, &created.id, &expected)?, ApplyResult::Created)
            }
            Some(grammar) if grammar.description != self.spec.description => {
                ctx.ledger.record(&self.id(), &grammar.id);
                ctx.api
                    .update_grammar(&grammar.id, &self.draft())
                    .map_err(|err| Error::api("update", name, err))?;
                (self.verify(ctx, &grammar.id, &expected)?, ApplyResult::Modified)
            }
            Some(grammar) => {
                ctx.ledger.record(&self.id(), &grammar.id);
                (grammar, ApplyResult::NoChange)
            }
        };

        if self.converge_languages(ctx, &grammar)? && matches!(result, ApplyResult::NoChange) {
            result = ApplyResult::Modified;
        }
        Ok(result)
    }
}

fn joined(languages: &BTreeSet<String>) -> String {
    if languages.is_empty() {
        return shown(None);
    }
    languages.iter().cloned().collect::<Vec<_>>().join(" ")
}

impl Resource for GrammarResource {
    fn id(&self) -> String {
        format!("grammar:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("Grammar {}", self.spec.name)
    }

    fn resource_type(&self) -> &'static str {
        "grammar"
    }

    fn tier(&self) -> Tier {
        Tier::Routing
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        let grammar = self
            .fetch(ctx)
            .with_context(|| format!("Failed to read grammar {}", self.spec.name))?;
        let Some(grammar) = grammar else {
            return Ok(ResourceState::Absent);
        };

        let mut drift = Drift::new();
        drift.compare_text(
            "description",
            grammar.description.as_deref(),
            self.spec.description.as_deref(),
        );
        let languages = grammar.language_codes();
        if languages != self.spec.languages {
            drift.note("languages", joined(&languages), joined(&self.spec.languages));
        }
        Ok(drift.into_state())
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }
        self.apply_grammar(ctx)
            .with_context(|| format!("Failed to apply grammar {}", self.spec.name))
    }

    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let name = &self.spec.name;
        let context = || format!("Failed to delete grammar {name}");
        let Some(grammar) = self.fetch(ctx).with_context(context)? else {
            ctx.ledger.forget(&self.id());
            return Ok(ApplyResult::NoChange);
        };

        if let Err(err) = ctx.api.delete_grammar(&grammar.id)
            && !err.is_not_found()
        {
            return Err(Error::api("delete", name, err)).with_context(context);
        }
        ctx.engine
            .delete_checker()
            .verify_gone(name, &grammar.id, |id| ctx.api.get_grammar(id))
            .with_context(context)?;

        ctx.ledger.forget(&self.id());
        ctx.catalogs.invalidate(Catalog::Grammars);
        Ok(ApplyResult::Removed)
    }
}
