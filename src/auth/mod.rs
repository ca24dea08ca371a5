//! Login, linking, and post-login routing

pub mod events;
pub mod handler;
pub mod linker;
pub mod redirect;

pub use events::{
    AfterLoginEvent, AuthEventPipeline, LoginEvent, LoginFailureEvent, NullEventPipeline,
};
pub use handler::{auth_action, AuthOutcome, AuthRequest, AuthRequestHandler};
pub use linker::{LinkOutcome, Notice, NoticeLevel, SessionLinker};
pub use redirect::{
    decode_return, resolve_admin_return, resolve_site_return, MenuLanguageLookup,
    PgMenuLanguageLookup,
};
