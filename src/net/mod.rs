pub mod broadcast;
pub mod canvas_session;
pub mod dos_protection;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;
