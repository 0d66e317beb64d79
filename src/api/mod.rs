pub mod http;
pub mod public;

pub use self::http::{router, ApiState};
pub use self::public::{PublicApi, PublicService};
