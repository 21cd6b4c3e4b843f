/// Pipeline definitions
///
/// A pipeline is a name (used as the lock label), the path prefixes it may
/// write under, and an ordered list of steps.

use crate::workflow::engine::StepContext;
use crate::workflow::types::StepError;
use serde_json::Value;

/// One named unit of work in a pipeline
///
/// Returning `Ok(Value::Null)` means the step produced no output.
pub trait Step {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<Value, StepError>;
}

/// Adapts a closure into a `Step`
pub struct FnStep<F> {
    name: String,
    body: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut StepContext<'_>) -> Result<Value, StepError>,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(&mut StepContext<'_>) -> Result<Value, StepError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<Value, StepError> {
        (self.body)(ctx)
    }
}

/// Ordered, named list of steps plus the scope they write under
pub struct Pipeline {
    name: String,
    scope: Vec<String>,
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Add a path prefix the pipeline may write under
    pub fn scope(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        if !self.scope.contains(&prefix) {
            self.scope.push(prefix);
        }
        self
    }

    /// Append a closure step
    pub fn step<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> Result<Value, StepError> + 'static,
    {
        self.with_step(FnStep::new(name, body))
    }

    /// Append any `Step` implementation
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scopes(&self) -> &[String] {
        &self.scope
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fetch;

    impl Step for Fetch {
        fn name(&self) -> &str {
            "fetch"
        }

        fn run(&self, _ctx: &mut StepContext<'_>) -> Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn builder_keeps_order_and_dedupes_scope() {
        let pipeline = Pipeline::new("weekly-sync")
            .scope("activities/")
            .scope("activities")
            .scope("/metrics/weekly")
            .with_step(Fetch)
            .step("normalize", |_| Ok(Value::Null))
            .step("persist", |_| Ok(Value::Null));

        assert_eq!(pipeline.name(), "weekly-sync");
        assert_eq!(pipeline.scopes(), ["activities", "metrics/weekly"]);
        assert_eq!(pipeline.step_names(), ["fetch", "normalize", "persist"]);
        assert_eq!(pipeline.len(), 3);
    }
}
