// src/plugins/mod.rs

//! Concrete, stub-level plugin bodies that make `handyrepd` runnable
//! standalone. Full production plugins (arbitrary service managers, every
//! connection pooler, every auth backend) are out of scope per the
//! project's non-goals — these exist to exercise the plugin contract
//! end-to-end for the capabilities `handyrepd` depends on directly:
//! local password auth, `pg_ctl`-based restarts, and PgBouncer routing.

pub mod auth_local;
pub mod pg_ctl;
pub mod pgbouncer;
pub mod webhook_alert;
