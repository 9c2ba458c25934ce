// ABOUTME: Subcommand implementations for the sandpool binary
// ABOUTME: Each module talks to a running scheduler over HTTP

pub mod pool;
