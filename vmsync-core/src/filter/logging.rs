use super::{Filter, FilterContext};
use crate::error::Rejection;

type Exclude = Box<dyn Fn(&FilterContext<'_>) -> bool + Send + Sync>;

/// Developer logging of every exchange at `debug` level.
#[derive(Default)]
pub struct LoggingFilter {
    exclude: Option<Exclude>,
}

impl LoggingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip exchanges for which `predicate` returns true.
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Box::new(predicate));
        self
    }

    fn skip(&self, ctx: &FilterContext<'_>) -> bool {
        self.exclude.as_ref().is_some_and(|exclude| exclude(ctx))
    }
}

impl Filter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_inbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        if !self.skip(ctx) {
            tracing::debug!(
                connection = %ctx.connection,
                instance = %ctx.instance,
                vm_type = ctx.vm_type,
                verb = %ctx.verb,
                properties = ctx.inbound.len(),
                "<- inbound"
            );
        }
        Ok(())
    }

    fn on_outbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        if !self.skip(ctx) {
            let changes = ctx.outbound.as_ref().map_or(0, |diff| diff.len());
            tracing::debug!(
                connection = %ctx.connection,
                instance = %ctx.instance,
                vm_type = ctx.vm_type,
                verb = %ctx.verb,
                changes,
                "-> outbound"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoggingFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingFilter")
            .field("exclude", &self.exclude.is_some())
            .finish()
    }
}
