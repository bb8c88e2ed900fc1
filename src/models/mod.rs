pub mod config;
pub mod job;
pub mod option;
pub mod site_rule;

pub use config::ServerConfig;
pub use job::{Job, JobRecord, JobStatus, NewJob, OutputLine, OutputStream};
pub use option::{OptionDef, OptionKind, OptionSet, OptionValue};
pub use site_rule::{SiteMatch, SiteRule};
