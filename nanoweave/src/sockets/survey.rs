use std::time::Duration;

use nanoweave_core::error::Result;
use nanoweave_core::options::SocketOptions;
use nanoweave_core::transport::Engine;

typed_socket! {
    /// Surveyor. Broadcasts a survey and collects replies until the
    /// survey deadline passes.
    Surveyor0 => Surveyor0
}

typed_socket! {
    /// Respondent. Answers each survey at most once.
    Respondent0 => Respondent0
}

impl Surveyor0 {
    /// Open with a custom survey deadline.
    pub fn with_survey_time(engine: &Engine, survey_time: Duration) -> Result<Self> {
        Self::with_options(engine, SocketOptions::default().with_survey_time(survey_time))
    }
}
