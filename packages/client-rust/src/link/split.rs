use std::sync::Arc;

use skein_core::Operation;

use super::{Chain, Next, OperationLink, OperationObservable};

type Condition = dyn Fn(&Operation) -> bool + Send + Sync;

/// Routes each operation to one of two sub-chains.
///
/// The condition is evaluated once per execution, before the chosen branch
/// is subscribed. Both branches must end in a terminating link; whatever
/// follows the split link in the outer chain is never reached.
#[derive(Clone)]
pub struct SplitLink {
    condition: Arc<Condition>,
    when_true: Chain,
    when_false: Chain,
}

impl SplitLink {
    pub fn new(
        condition: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        when_true: Chain,
        when_false: Chain,
    ) -> Self {
        Self {
            condition: Arc::new(condition),
            when_true,
            when_false,
        }
    }
}

impl OperationLink for SplitLink {
    fn call(&self, op: Operation, _next: Next) -> OperationObservable {
        if (self.condition)(&op) {
            self.when_true.execute(op)
        } else {
            self.when_false.execute(op)
        }
    }
}
