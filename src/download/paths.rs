// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Destination folders and file names.

use std::path::{Path, PathBuf};

use crate::config::Settings;

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replace characters that are invalid on common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Folder name for a platform without an explicit mapping.
pub fn normalize_platform_name(platform: &str) -> String {
    sanitize_filename(&platform.trim().to_lowercase().replace(' ', "_"))
}

fn is_bios_platform(settings: &Settings, platform: &str, folder: &str) -> bool {
    folder == "bios" || settings.bios_platforms.iter().any(|p| p == platform)
}

/// Folder name used for `platform`.
pub fn platform_folder(settings: &Settings, platform: &str) -> String {
    settings
        .platform_folders
        .get(platform)
        .cloned()
        .unwrap_or_else(|| normalize_platform_name(platform))
}

/// Directory a job for `platform` downloads into.
pub fn destination_dir(settings: &Settings, platform: &str) -> PathBuf {
    let folder = platform_folder(settings, platform);
    if is_bios_platform(settings, platform, &folder) {
        return settings.bios_dir.clone().unwrap_or_else(|| settings.roms_dir.clone());
    }
    if settings.symlink_layout {
        settings.roms_dir.join(&folder).join(&folder)
    } else {
        settings.roms_dir.join(&folder)
    }
}

/// True when downloads for `platform` must always be unpacked.
pub fn requires_extraction(settings: &Settings, platform: &str) -> bool {
    let folder = platform_folder(settings, platform);
    is_bios_platform(settings, platform, &folder)
        || settings
            .extract_platforms
            .iter()
            .any(|p| p == platform || p.eq_ignore_ascii_case(&folder))
}

/// Lowercased extension of the last path segment of `url`.
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let decoded = urlencoding::decode(&segment).map(|s| s.into_owned()).unwrap_or(segment);
    Path::new(&decoded)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Longest suffix after the last dot that still counts as a file extension.
const MAX_EXTENSION_LEN: usize = 4;

/// Split `name` into stem and extension.
///
/// Only a short alphanumeric suffix with at least one letter is an extension,
/// so `"Super Mario Bros. 3 (USA)"` and `"Game v1.1"` have none while
/// `"Foo.7z"` and `"Foo (USA).sfc"` do.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=MAX_EXTENSION_LEN).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic()) =>
        {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

/// File name for a job.
///
/// A provider-reported name wins. Otherwise the display name is used, with
/// the URL's extension appended unless the display name already ends in it
/// or in another file extension.
pub fn target_filename(display_name: &str, provider_name: Option<&str>, source_url: &str) -> String {
    if let Some(name) = provider_name.filter(|n| !n.trim().is_empty()) {
        return sanitize_filename(name);
    }
    let base = sanitize_filename(display_name);
    let url_ext = url_extension(source_url);
    let already_named = match (base.rsplit_once('.'), url_ext.as_deref()) {
        (Some((_, ext)), Some(wanted)) if ext.eq_ignore_ascii_case(wanted) => true,
        _ => split_extension(&base).1.is_some(),
    };
    match url_ext {
        Some(ext) if !already_named => format!("{}.{}", base, ext),
        _ => base,
    }
}

/// Strip the `&af=` affiliate suffix from a locker link.
pub fn strip_affiliate(url: &str) -> &str {
    url.split("&af=").next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::rooted_at(Path::new("/srv"))
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_filename("Foo: Bar?"), "Foo_ Bar_");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("  ..  "), "download");
        assert_eq!(sanitize_filename("Zelda (USA).zip"), "Zelda (USA).zip");
    }

    #[test]
    fn test_destination_dir() {
        let mut settings = settings();
        assert_eq!(destination_dir(&settings, "SNES"), PathBuf::from("/srv/roms/snes"));

        settings.platform_folders.insert("Super Nintendo".into(), "snes".into());
        assert_eq!(destination_dir(&settings, "Super Nintendo"), PathBuf::from("/srv/roms/snes"));

        settings.symlink_layout = true;
        assert_eq!(destination_dir(&settings, "SNES"), PathBuf::from("/srv/roms/snes/snes"));
    }

    #[test]
    fn test_bios_goes_to_bios_dir() {
        let mut settings = settings();
        assert_eq!(destination_dir(&settings, "BIOS"), PathBuf::from("/srv/roms"));
        settings.bios_dir = Some(PathBuf::from("/srv/bios"));
        assert_eq!(destination_dir(&settings, "- BIOS by TMCTV -"), PathBuf::from("/srv/bios"));
        assert_eq!(destination_dir(&settings, "Bios"), PathBuf::from("/srv/bios"));
    }

    #[test]
    fn test_requires_extraction() {
        let settings = settings();
        assert!(requires_extraction(&settings, "BIOS"));
        assert!(requires_extraction(&settings, "PlayStation 3"));
        assert!(requires_extraction(&settings, "PS3"));
        assert!(!requires_extraction(&settings, "SNES"));
    }

    #[test]
    fn test_target_filename() {
        assert_eq!(target_filename("Foo", None, "https://host/a.zip"), "Foo.zip");
        assert_eq!(target_filename("Foo.7z", None, "https://host/a.zip"), "Foo.7z");
        assert_eq!(target_filename("Foo", None, "https://host/dl?id=3"), "Foo");
        assert_eq!(
            target_filename("Foo", Some("Foo (Europe).zip"), "https://host/a.zip"),
            "Foo (Europe).zip"
        );
        assert_eq!(
            target_filename("Foo", None, "https://host/files/Super%20Game.RAR"),
            "Foo.rar"
        );
    }

    #[test]
    fn test_dotted_display_names_keep_url_extension() {
        assert_eq!(
            target_filename("Super Mario Bros. 3 (USA)", None, "https://host/smb3.zip"),
            "Super Mario Bros. 3 (USA).zip"
        );
        assert_eq!(target_filename("Super Mario Bros. 3", None, "https://host/smb3.zip"), "Super Mario Bros. 3.zip");
        assert_eq!(target_filename("Game v1.1", None, "https://host/g.7z"), "Game v1.1.7z");
        assert_eq!(target_filename("Dr. Mario (World)", None, "https://host/d.zip"), "Dr. Mario (World).zip");
        assert_eq!(target_filename("Foo (USA).sfc", None, "https://host/f.zip"), "Foo (USA).sfc");
        assert_eq!(target_filename("Foo.ZIP", None, "https://host/f.zip"), "Foo.ZIP");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("Foo.zip"), ("Foo", Some("zip")));
        assert_eq!(split_extension("Foo.7z"), ("Foo", Some("7z")));
        assert_eq!(split_extension("Super Mario Bros. 3"), ("Super Mario Bros. 3", None));
        assert_eq!(split_extension("Super Mario Bros. 3.iso"), ("Super Mario Bros. 3", Some("iso")));
        assert_eq!(split_extension("Game v1.1"), ("Game v1.1", None));
        assert_eq!(split_extension(".zip"), (".zip", None));
        assert_eq!(split_extension("Foo"), ("Foo", None));
    }

    #[test]
    fn test_strip_affiliate() {
        assert_eq!(strip_affiliate("https://1fichier.com/?abc&af=42"), "https://1fichier.com/?abc");
        assert_eq!(strip_affiliate("https://1fichier.com/?abc"), "https://1fichier.com/?abc");
    }
}
