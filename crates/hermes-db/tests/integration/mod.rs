pub mod common;

mod checkpoint_tests;
mod failed_task_tests;
mod run_tests;
