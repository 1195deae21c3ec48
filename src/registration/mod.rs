pub mod agent;
pub mod machine;
pub mod record;

pub use agent::{AgentHost, AgentState, NoopHost, RegistrationAgent, SignalTag};
pub use record::{instance_key, service_prefix, InstanceIdSource, InstanceRecord, ParsedKey};
