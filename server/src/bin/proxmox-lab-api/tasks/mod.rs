pub mod auto_shutdown;
pub mod hostname_rename;
pub mod ip_scan;
