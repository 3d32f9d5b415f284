//! Escalation from a detected challenge to a registered solver.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use url::Url;

use super::detectors::ChallengeKind;
use super::solvers::{ChallengeSolver, SolveRequest, TitleCondition};
use crate::cookies::CookieJar;
use crate::fetch::{FetchError, FetchResultT};
use crate::modules::events::{ChallengeStage, EventDispatcher};

/// Maps challenge kinds to solvers and runs them against the shared jar.
#[derive(Clone)]
pub struct EscalationDispatcher {
    solvers: BTreeMap<ChallengeKind, Arc<dyn ChallengeSolver>>,
    enabled: bool,
    events: Arc<EventDispatcher>,
}

impl fmt::Debug for EscalationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let solvers: Vec<_> = self
            .solvers
            .iter()
            .map(|(kind, solver)| (kind.name(), solver.name()))
            .collect();
        f.debug_struct("EscalationDispatcher")
            .field("solvers", &solvers)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl EscalationDispatcher {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            solvers: BTreeMap::new(),
            enabled: true,
            events,
        }
    }

    /// Register (or replace) the solver for `kind`.
    pub fn register(&mut self, kind: ChallengeKind, solver: Arc<dyn ChallengeSolver>) {
        log::debug!("registering {} solver for {kind} challenges", solver.name());
        self.solvers.insert(kind, solver);
    }

    pub fn unregister(&mut self, kind: ChallengeKind) -> Option<Arc<dyn ChallengeSolver>> {
        self.solvers.remove(&kind)
    }

    pub fn solver_for(&self, kind: ChallengeKind) -> Option<&Arc<dyn ChallengeSolver>> {
        self.solvers.get(&kind)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run the solver registered for `kind` with the WAF's default title
    /// condition. Cookies it collected are merged into `jar` whether or not
    /// it succeeded.
    pub async fn attempt_escalation(
        &self,
        kind: ChallengeKind,
        url: &Url,
        jar: &CookieJar,
        headers: &[(String, String)],
    ) -> FetchResultT<bool> {
        let solver = self
            .solvers
            .get(&kind)
            .filter(|_| self.enabled)
            .ok_or(FetchError::NoSolverRegistered(kind))?;

        log::warn!("{kind} challenge on {url}! Doing automatic step-through.");
        let solved = self
            .run(solver.as_ref(), url, TitleCondition::for_kind(kind), jar, headers)
            .await?;

        let stage = if solved {
            ChallengeStage::Solved
        } else {
            ChallengeStage::SolveFailed
        };
        self.events.challenge(url.as_str(), kind, stage);
        Ok(solved)
    }

    /// Step through an arbitrary JS WAF with the first registered solver and
    /// a caller-supplied title condition.
    pub async fn step_through(
        &self,
        url: &Url,
        condition: TitleCondition,
        jar: &CookieJar,
        headers: &[(String, String)],
    ) -> FetchResultT<bool> {
        let (kind, solver) = self
            .solvers
            .iter()
            .next()
            .ok_or(FetchError::NoSolverRegistered(ChallengeKind::Cloudflare))?;
        log::info!("manual step-through of {url} using the {kind} solver ({condition})");
        self.run(solver.as_ref(), url, condition, jar, headers).await
    }

    async fn run(
        &self,
        solver: &dyn ChallengeSolver,
        url: &Url,
        condition: TitleCondition,
        jar: &CookieJar,
        headers: &[(String, String)],
    ) -> FetchResultT<bool> {
        let request = SolveRequest {
            url: url.clone(),
            condition,
            cookies: jar.matching(url),
            headers: headers.to_vec(),
        };

        let outcome = solver.solve(request).await.inspect_err(|err| {
            self.events.error(url.as_str(), err);
        })?;

        log::debug!(
            "{} solver returned {} cookies (success: {})",
            solver.name(),
            outcome.cookies.len(),
            outcome.success
        );
        jar.merge(outcome.cookies);
        jar.save().await?;
        Ok(outcome.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::solvers::{SolveOutcome, SolverError};
    use crate::cookies::CookieEntry;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedSolver {
        success: bool,
        seen: Mutex<Vec<TitleCondition>>,
    }

    #[async_trait]
    impl ChallengeSolver for FixedSolver {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn solve(&self, request: SolveRequest) -> Result<SolveOutcome, SolverError> {
            self.seen.lock().unwrap().push(request.condition);
            Ok(SolveOutcome {
                success: self.success,
                cookies: vec![CookieEntry::new("cf_clearance", "token", ".example.com")],
                title: None,
            })
        }
    }

    fn url() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[tokio::test]
    async fn missing_or_disabled_solver_is_an_error() {
        let jar = CookieJar::new();
        let mut dispatcher = EscalationDispatcher::new(Arc::new(EventDispatcher::new()));
        let err = dispatcher
            .attempt_escalation(ChallengeKind::Sucuri, &url(), &jar, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoSolverRegistered(ChallengeKind::Sucuri)));

        dispatcher.register(
            ChallengeKind::Sucuri,
            Arc::new(FixedSolver {
                success: true,
                seen: Mutex::new(Vec::new()),
            }),
        );
        dispatcher.set_enabled(false);
        assert!(
            dispatcher
                .attempt_escalation(ChallengeKind::Sucuri, &url(), &jar, &[])
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cookies_are_merged_even_on_failure() {
        let jar = CookieJar::new();
        let solver = Arc::new(FixedSolver {
            success: false,
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = EscalationDispatcher::new(Arc::new(EventDispatcher::new()));
        dispatcher.register(ChallengeKind::Cloudflare, solver.clone());

        let solved = dispatcher
            .attempt_escalation(ChallengeKind::Cloudflare, &url(), &jar, &[])
            .await
            .unwrap();
        assert!(!solved);
        assert!(jar.has_cookie_prefix("example.com", "cf_clearance"));
        assert_eq!(
            solver.seen.lock().unwrap().as_slice(),
            [TitleCondition::NotContains("Just a moment...".into())]
        );
    }
}
