pub mod switch_coordinator;
