//! Step plan and resolver.
//!
//! Steps form a strict total order. The resolver is a pure function from
//! (persisted checkpoint, live location observation) to the step to run
//! next. The one subtle rule is precedence: when the live location
//! unambiguously identifies a *later* stage than the checkpoint -- the
//! environment moved on through an external redirect the engine did not
//! initiate -- the live location wins, so completed steps are never
//! replayed. Ambiguous locations prefer the step consistent with an already
//! populated aux context (e.g. skip regenerating a correspondence address).

use stepline_types::state::WorkflowState;

use crate::environment::LocationSignal;

// ---------------------------------------------------------------------------
// StepSpec / StepPlan
// ---------------------------------------------------------------------------

/// One stage in the fixed linear step order.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Unique step id (e.g. "fill-form", "verify-email").
    pub id: String,
    /// Signal token identifying this step's location, when one exists.
    /// Steps without a distinguishing location are only reached by order.
    pub location: Option<String>,
    /// Whether this step produces the aux context (used to break location
    /// ambiguity: once aux exists, regeneration steps are skipped).
    pub produces_aux: bool,
}

impl StepSpec {
    /// A step identified by a location signal.
    pub fn at(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: Some(location.into()),
            produces_aux: false,
        }
    }

    /// A step reached only by order, with no distinguishing location.
    pub fn ordered(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: None,
            produces_aux: false,
        }
    }

    /// Mark this step as producing the aux context.
    pub fn producing_aux(mut self) -> Self {
        self.produces_aux = true;
        self
    }
}

/// The strict total order of steps S0..Sn.
#[derive(Debug, Clone)]
pub struct StepPlan {
    steps: Vec<StepSpec>,
}

impl StepPlan {
    /// Build a plan, validating non-emptiness and id uniqueness.
    pub fn new(steps: Vec<StepSpec>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        for (i, step) in steps.iter().enumerate() {
            if steps[..i].iter().any(|s| s.id == step.id) {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
        }
        Ok(Self { steps })
    }

    /// All steps in plan order.
    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// The first step of the plan.
    pub fn first(&self) -> &StepSpec {
        &self.steps[0]
    }

    /// Index of a step id within the plan.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Spec at a given index.
    pub fn get(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// The step after `step_id`, `None` when `step_id` is the last step.
    pub fn next_after(&self, step_id: &str) -> Option<&StepSpec> {
        self.index_of(step_id).and_then(|i| self.steps.get(i + 1))
    }

    /// Whether `step_id` is the final step of the plan.
    pub fn is_last(&self, step_id: &str) -> bool {
        self.index_of(step_id)
            .is_some_and(|i| i == self.steps.len() - 1)
    }
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

/// Determine the step to run next from the persisted checkpoint and a fresh
/// location read.
pub fn resolve<'p>(
    plan: &'p StepPlan,
    state: &WorkflowState,
    location: &LocationSignal,
) -> &'p StepSpec {
    let persisted_idx = state
        .current_step_id
        .as_deref()
        .and_then(|id| plan.index_of(id));

    // Which steps does the live location identify?
    let candidates: Vec<usize> = plan
        .steps
        .iter()
        .enumerate()
        .filter(|(_, spec)| {
            spec.location
                .as_deref()
                .is_some_and(|token| location.matches(token))
        })
        .map(|(i, _)| i)
        .collect();

    let live_idx = match candidates.as_slice() {
        [] => None,
        [single] => Some(*single),
        many => {
            // Ambiguous: prefer the step consistent with aux context.
            if state.aux_context.is_some() {
                // Aux already produced; skip regeneration, take the latest
                // candidate that does not produce it (fall back to the
                // latest overall).
                many.iter()
                    .rev()
                    .find(|&&i| !plan.steps[i].produces_aux)
                    .or(many.last())
                    .copied()
            } else {
                many.first().copied()
            }
        }
    };

    let chosen = match (persisted_idx, live_idx) {
        // Live location identifies a later stage: the environment moved on
        // since the checkpoint; never replay what it already completed.
        (Some(p), Some(l)) if l > p => {
            tracing::debug!(
                persisted = plan.steps[p].id.as_str(),
                live = plan.steps[l].id.as_str(),
                "live location ahead of checkpoint; trusting location"
            );
            l
        }
        (Some(p), _) => p,
        (None, Some(l)) => l,
        (None, None) => 0,
    };

    &plan.steps[chosen]
}

// ---------------------------------------------------------------------------
// PlanError
// ---------------------------------------------------------------------------

/// Errors building a step plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// A plan must contain at least one step.
    #[error("step plan is empty")]
    Empty,

    /// Step ids must be unique within a plan.
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signup_plan() -> StepPlan {
        StepPlan::new(vec![
            StepSpec::at("fill-form", "/signup/form"),
            StepSpec::at("gen-address", "/signup/contact").producing_aux(),
            StepSpec::at("use-address", "/signup/contact"),
            StepSpec::at("verify-email", "/signup/verify"),
            StepSpec::ordered("finish"),
        ])
        .unwrap()
    }

    fn state_at(step: Option<&str>) -> WorkflowState {
        WorkflowState {
            current_step_id: step.map(String::from),
            run_flag: true,
            ..WorkflowState::default()
        }
    }

    // -------------------------------------------------------------------
    // Plan construction
    // -------------------------------------------------------------------

    #[test]
    fn test_empty_plan_rejected() {
        assert!(matches!(StepPlan::new(vec![]), Err(PlanError::Empty)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = StepPlan::new(vec![
            StepSpec::ordered("a"),
            StepSpec::ordered("a"),
        ]);
        assert!(matches!(result, Err(PlanError::DuplicateStepId(id)) if id == "a"));
    }

    #[test]
    fn test_plan_order_helpers() {
        let plan = signup_plan();
        assert_eq!(plan.first().id, "fill-form");
        assert_eq!(plan.next_after("fill-form").unwrap().id, "gen-address");
        assert!(plan.next_after("finish").is_none());
        assert!(plan.is_last("finish"));
        assert!(!plan.is_last("fill-form"));
    }

    // -------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------

    #[test]
    fn test_fresh_state_unknown_location_starts_at_first_step() {
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(None),
            &LocationSignal("about:blank".to_string()),
        );
        assert_eq!(step.id, "fill-form");
    }

    #[test]
    fn test_fresh_state_with_matching_location() {
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(None),
            &LocationSignal("https://x.org/signup/verify".to_string()),
        );
        assert_eq!(step.id, "verify-email");
    }

    #[test]
    fn test_live_location_ahead_of_checkpoint_wins() {
        // Checkpointed at fill-form, but an external redirect already moved
        // the environment to the verify page.
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(Some("fill-form")),
            &LocationSignal("https://x.org/signup/verify".to_string()),
        );
        assert_eq!(step.id, "verify-email");
    }

    #[test]
    fn test_stale_looking_location_does_not_rewind() {
        // Checkpointed at verify-email; the location still shows the form
        // page (render lag). Never replay a completed step.
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(Some("verify-email")),
            &LocationSignal("https://x.org/signup/form".to_string()),
        );
        assert_eq!(step.id, "verify-email");
    }

    #[test]
    fn test_no_location_match_uses_checkpoint() {
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(Some("gen-address")),
            &LocationSignal("about:blank".to_string()),
        );
        assert_eq!(step.id, "gen-address");
    }

    #[test]
    fn test_ambiguous_location_without_aux_prefers_earlier() {
        // /signup/contact matches both gen-address and use-address.
        let plan = signup_plan();
        let step = resolve(
            &plan,
            &state_at(None),
            &LocationSignal("https://x.org/signup/contact".to_string()),
        );
        assert_eq!(step.id, "gen-address");
    }

    #[test]
    fn test_ambiguous_location_with_aux_skips_regeneration() {
        let plan = signup_plan();
        let mut state = state_at(Some("fill-form"));
        state.aux_context = Some(json!({"address": "w-17@relay.example.org"}));
        let step = resolve(
            &plan,
            &state,
            &LocationSignal("https://x.org/signup/contact".to_string()),
        );
        assert_eq!(step.id, "use-address");
    }
}
