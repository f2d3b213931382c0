//! Classified retry budgets for SQL generation.
//!
//! Every failed generation, consistency check, or execution is recorded under
//! its [`SqlErrorType`]. Each category is compared against its own ceiling;
//! `UNKNOWN` failures share the total-attempt ceiling. Counters only grow
//! within a run and a new run starts from a fresh classifier.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::retry::{RetryContext, SqlErrorType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_syntax: u32,
    pub max_semantic: u32,
    pub max_execution: u32,
    pub max_total: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self { max_syntax: 3, max_semantic: 3, max_execution: 3, max_total: 10 }
    }
}

impl RetryBudget {
    pub fn ceiling(&self, category: SqlErrorType) -> u32 {
        match category {
            SqlErrorType::Syntax => self.max_syntax,
            SqlErrorType::Semantic => self.max_semantic,
            SqlErrorType::Execution => self.max_execution,
            SqlErrorType::Unknown => self.max_total,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    by_category: BTreeMap<SqlErrorType, u32>,
    total: u32,
}

impl RetryCounters {
    pub fn count(&self, category: SqlErrorType) -> u32 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    fn record(&mut self, category: SqlErrorType) {
        *self.by_category.entry(category).or_insert(0) += 1;
        self.total += 1;
    }
}

impl fmt::Display for RetryCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syntax={}, semantic={}, execution={}, unknown={}, total={}",
            self.count(SqlErrorType::Syntax),
            self.count(SqlErrorType::Semantic),
            self.count(SqlErrorType::Execution),
            self.count(SqlErrorType::Unknown),
            self.total
        )
    }
}

/// The budget that ran out, with a snapshot of every counter at that moment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetExhausted {
    pub category: SqlErrorType,
    pub ceiling: u32,
    pub counters: RetryCounters,
    pub last_reason: String,
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SQL generation stopped: {} limit reached ({}/{}); counts: {}; last failure: {}",
            self.category.limit_label(),
            self.exhausted_count(),
            self.ceiling,
            self.counters,
            self.last_reason
        )
    }
}

impl BudgetExhausted {
    fn exhausted_count(&self) -> u32 {
        match self.category {
            SqlErrorType::Unknown => self.counters.total(),
            category => self.counters.count(category),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(RetryContext),
    EndRun(BudgetExhausted),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlRetryClassifier {
    budget: RetryBudget,
    counters: RetryCounters,
}

impl SqlRetryClassifier {
    pub fn new(budget: RetryBudget) -> Self {
        Self { budget, counters: RetryCounters::default() }
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    pub fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    pub fn is_exhausted(&self, category: SqlErrorType) -> bool {
        let used = match category {
            SqlErrorType::Unknown => self.counters.total(),
            other => self.counters.count(other),
        };
        used >= self.budget.ceiling(category)
    }

    /// Records a failure and decides whether SQL generation may run again.
    pub fn record_failure(&mut self, context: RetryContext) -> RetryDecision {
        let category = context.error_type;
        self.counters.record(category);

        if self.is_exhausted(category) {
            let exhausted = BudgetExhausted {
                category,
                ceiling: self.budget.ceiling(category),
                counters: self.counters.clone(),
                last_reason: context.reason,
            };
            warn!(
                event_name = "sql_retry.budget_exhausted",
                category = %category,
                ceiling = exhausted.ceiling,
                counts = %self.counters,
                "sql retry budget exhausted, ending run"
            );
            return RetryDecision::EndRun(exhausted);
        }

        info!(
            event_name = "sql_retry.retry_scheduled",
            category = %category,
            counts = %self.counters,
            "retrying sql generation"
        );
        RetryDecision::Retry(context)
    }
}

#[cfg(test)]
mod tests {
    use super::{RetryBudget, RetryDecision, SqlRetryClassifier};
    use crate::domain::retry::{RetryContext, SqlErrorType};

    #[test]
    fn third_execution_failure_ends_run_at_ceiling_three() {
        let mut classifier = SqlRetryClassifier::new(RetryBudget::default());

        let first = classifier.record_failure(RetryContext::execution("no such column"));
        let second = classifier.record_failure(RetryContext::execution("no such column"));
        let third = classifier.record_failure(RetryContext::execution("no such column"));

        assert!(matches!(first, RetryDecision::Retry(_)));
        assert!(matches!(second, RetryDecision::Retry(_)));
        let RetryDecision::EndRun(exhausted) = third else {
            panic!("third failure must end the run");
        };
        assert_eq!(exhausted.category, SqlErrorType::Execution);
        let message = exhausted.to_string();
        assert!(message.contains("execution error limit reached (3/3)"));
        assert!(message.contains("execution=3"));
        assert!(message.contains("total=3"));
    }

    #[test]
    fn categories_exhaust_independently() {
        let mut classifier = SqlRetryClassifier::new(RetryBudget {
            max_syntax: 1,
            max_semantic: 3,
            max_execution: 3,
            max_total: 10,
        });

        assert!(matches!(
            classifier.record_failure(RetryContext::syntax("unbalanced parens")),
            RetryDecision::EndRun(_)
        ));
        assert!(matches!(
            classifier.record_failure(RetryContext::semantic("wrong grouping")),
            RetryDecision::Retry(_)
        ));
        assert!(classifier.is_exhausted(SqlErrorType::Syntax));
        assert!(!classifier.is_exhausted(SqlErrorType::Semantic));
    }

    #[test]
    fn unknown_failures_use_the_total_ceiling() {
        let mut classifier = SqlRetryClassifier::new(RetryBudget {
            max_syntax: 5,
            max_semantic: 5,
            max_execution: 5,
            max_total: 3,
        });

        classifier.record_failure(RetryContext::semantic("a"));
        classifier.record_failure(RetryContext::execution("b"));
        let decision = classifier.record_failure(RetryContext::unknown("empty output"));

        let RetryDecision::EndRun(exhausted) = decision else {
            panic!("total ceiling should be reached");
        };
        assert!(exhausted.to_string().contains("total retry count limit reached (3/3)"));
    }

    #[test]
    fn counters_never_decrease_and_exhaustion_is_sticky() {
        let mut classifier = SqlRetryClassifier::new(RetryBudget {
            max_syntax: 2,
            ..RetryBudget::default()
        });
        let mut previous = 0;

        for _ in 0..5 {
            let decision = classifier.record_failure(RetryContext::syntax("bad token"));
            let count = classifier.counters().count(SqlErrorType::Syntax);
            assert!(count > previous);
            previous = count;
            if count >= 2 {
                assert!(matches!(decision, RetryDecision::EndRun(_)));
            }
        }

        let fresh = SqlRetryClassifier::new(RetryBudget::default());
        assert_eq!(fresh.counters().total(), 0);
    }
}
