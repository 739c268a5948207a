pub mod common;
mod queue_test;
mod router_test;
mod session_test;
