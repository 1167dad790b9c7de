mod common;

use common::isolated_lookup_path;
use dependency_scanner::system::WindowsSystem;
use dependency_scanner::{LookupPath, LookupPathEntry, ResolverConfig};
use fs_err as fs;
use std::path::Path;

fn touch(path: &Path) -> Result<(), std::io::Error> {
    fs::write(path, b"MZ")
}

#[test]
fn origin_directory_wins() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let app = root.path().join("app");
    let wd = root.path().join("wd");
    fs::create_dir_all(&app)?;
    fs::create_dir_all(&wd)?;
    touch(&app.join("shared.dll"))?;
    touch(&wd.join("shared.dll"))?;
    touch(&wd.join("workonly.dll"))?;

    let lookup = isolated_lookup_path(&wd, "DEPSCAN_TEST_RESOLVER_ORIGIN");

    let r = lookup.resolve("shared.dll", &app);
    assert_eq!(r.resolved_path, Some(app.join("shared.dll")));
    assert_eq!(r.location, Some(LookupPathEntry::ExecutableDir(app.clone())));
    assert_eq!(r.attempted_paths, vec![app.join("shared.dll")]);

    let r = lookup.resolve("workonly.dll", &app);
    assert!(r.found());
    assert_eq!(r.location, Some(LookupPathEntry::WorkingDir(wd.clone())));
    assert_eq!(
        r.attempted_paths,
        vec![app.join("workonly.dll"), wd.join("workonly.dll")]
    );
    Ok(())
}

#[test]
fn names_match_ignoring_case() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    touch(&root.path().join("MixedCase.DLL"))?;

    let lookup = isolated_lookup_path(root.path(), "DEPSCAN_TEST_RESOLVER_CASE");
    let r = lookup.resolve("mixedcase.dll", root.path());
    assert_eq!(r.resolved_path, Some(root.path().join("MixedCase.DLL")));
    Ok(())
}

#[test]
fn full_search_order() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let windows = root.path().join("Windows");
    let system32 = windows.join("System32");
    let syswow64 = windows.join("SysWOW64");
    let app = root.path().join("app");
    let wd = root.path().join("wd");
    let extra = root.path().join("extra");
    for d in [&system32, &syswow64, &app, &wd, &extra] {
        fs::create_dir_all(d)?;
    }
    touch(&extra.join("fromenv.dll"))?;
    touch(&syswow64.join("compat.dll"))?;

    let var = "DEPSCAN_TEST_RESOLVER_ORDER";
    std::env::set_var(var, std::env::join_paths([&extra])?);

    let lookup = LookupPath::new(ResolverConfig {
        system: WindowsSystem::from_root(root.path()),
        working_dir: Some(wd.clone()),
        search_path_var: var.to_owned(),
    });

    assert_eq!(
        lookup.search_path(&app),
        vec![
            LookupPathEntry::ExecutableDir(app.clone()),
            LookupPathEntry::SystemDir(system32.clone()),
            LookupPathEntry::SystemDir(syswow64.clone()),
            LookupPathEntry::WindowsDir(windows.clone()),
            LookupPathEntry::WorkingDir(wd.clone()),
            LookupPathEntry::SystemPath(extra.clone()),
        ]
    );

    let r = lookup.resolve("fromenv.dll", &app);
    assert_eq!(r.resolved_path, Some(extra.join("fromenv.dll")));
    assert_eq!(r.attempted_paths.len(), 6);
    assert_eq!(r.attempted_paths[1], system32.join("fromenv.dll"));

    let r = lookup.resolve("compat.dll", &app);
    assert_eq!(r.location, Some(LookupPathEntry::SystemDir(syswow64.clone())));
    assert!(lookup.is_system_module("compat.dll"));

    let r = lookup.resolve("nowhere.dll", &app);
    assert!(!r.found());
    assert_eq!(r.location, None);
    assert_eq!(r.attempted_paths.len(), 6);
    Ok(())
}

#[test]
fn search_path_variable_is_filtered() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let a = root.path().join("a");
    let b = root.path().join("b");
    fs::create_dir_all(&a)?;
    fs::create_dir_all(&b)?;

    let var = "DEPSCAN_TEST_RESOLVER_FILTER";
    let value = std::env::join_paths([
        a.clone(),
        root.path().join("does_not_exist"),
        a.clone(),
        std::path::PathBuf::from("//fileserver/share/bin"),
        b.clone(),
    ])?;
    std::env::set_var(var, value);

    let lookup = isolated_lookup_path(root.path(), var);
    let entries: Vec<LookupPathEntry> = lookup
        .search_path("")
        .into_iter()
        .filter(|e| matches!(e, LookupPathEntry::SystemPath(_)))
        .collect();
    assert_eq!(
        entries,
        vec![LookupPathEntry::SystemPath(a), LookupPathEntry::SystemPath(b)]
    );
    Ok(())
}

#[test]
fn results_are_stable() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    touch(&root.path().join("lib.dll"))?;
    let lookup = isolated_lookup_path(root.path(), "DEPSCAN_TEST_RESOLVER_STABLE");

    let first = lookup.resolve("lib.dll", root.path());
    let second = lookup.resolve("lib.dll", root.path());
    assert_eq!(first, second);

    let missing_first = lookup.resolve("other.dll", root.path());
    let missing_second = lookup.resolve("other.dll", root.path());
    assert_eq!(missing_first, missing_second);
    assert!(!missing_first.found());
    Ok(())
}

#[test]
fn system_modules() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let lookup = isolated_lookup_path(root.path(), "DEPSCAN_TEST_RESOLVER_SYSTEM");
    assert!(lookup.is_system_module("ws2_32.dll"));
    assert!(lookup.is_system_module("KERNEL32.dll"));
    assert!(!lookup.is_system_module("customapp.dll"));
    Ok(())
}
