//! Process environment setup.

/// Drop risky or irrelevant variables inherited from the service manager
/// and pin the few we rely on.
pub fn sanitize_environment_vars() {
    let keep = ["PATH", "HOME", "USER", "SHELL", "TERM", "PLM_DEBUG", "LANG", "LC_ALL"];

    let to_remove: Vec<String> = std::env::vars()
        .map(|(name, _)| name)
        .filter(|name| !keep.contains(&name.as_str()))
        .collect();

    for name in to_remove {
        std::env::remove_var(name);
    }

    std::env::set_var("LC_ALL", "C");
    if std::env::var_os("PATH").is_none() {
        std::env::set_var("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    }
}
