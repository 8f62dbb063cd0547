pub mod unified_exec;
