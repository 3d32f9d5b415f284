// WAF challenge detection and the hand-off to solvers that step through them.

pub mod detectors;
pub mod escalation;
pub mod solvers;
