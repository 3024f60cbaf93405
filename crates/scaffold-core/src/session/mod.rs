pub mod factory;
pub mod resolver;

pub use factory::{
    DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT, SessionDatabase, SessionFactoryConfig,
    SessionStats, SessionStoreFactory,
};
pub use resolver::{
    IpSessionMapping, RequestFacts, ResolvedSession, ResolverConfig, SessionResolver,
    SessionSource,
};
