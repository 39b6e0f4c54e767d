use sandbox_rules::DelaySpec;

/// How strictly rendered responses are checked against the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseValidation {
    /// A mismatch replaces the response with a 500 problem document.
    Strict,
    /// A mismatch is logged and the response is sent as-is.
    #[default]
    Warn,
    Off,
}

/// Pipeline behavior knobs, mapped from the application configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub validate_requests: bool,
    pub response_validation: ResponseValidation,
    /// Drives determinism of template RNG and data generation; combined
    /// with the correlation id per request.
    pub seed: String,
    /// Injected latency applied before rule execution.
    pub chaos_latency: Option<DelaySpec>,
    /// Probability of replacing the response with an injected 500.
    pub chaos_error_rate: f64,
    /// Budget for rule execution, including store calls and delays.
    pub action_deadline: std::time::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validate_requests: true,
            response_validation: ResponseValidation::default(),
            seed: "sandbox".to_string(),
            chaos_latency: None,
            chaos_error_rate: 0.0,
            action_deadline: std::time::Duration::from_secs(30),
        }
    }
}
