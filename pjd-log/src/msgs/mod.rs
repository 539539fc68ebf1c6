mod receive;
pub use self::receive::*;
mod send;
pub use self::send::*;
mod session;
pub use self::session::*;
mod scheduler;
pub use self::scheduler::*;
mod system;
pub use self::system::*;
