//! Branch-derived names: worktree directory slugs and multiplexer window
//! names. Kept dependency-free; byte-wise validation matches what the git
//! and tmux CLIs will accept.

/// Short-SHA length used in worktree directory names.
const SHORT_SHA_LEN: usize = 7;

/// Lowercases a branch name and reduces it to `[a-z0-9-]`: common separators
/// become hyphens, anything else is dropped, runs of hyphens collapse.
///
/// `feature/Foo_bar baz` -> `feature-foo-bar-baz`
pub fn slugify(branch: &str) -> String {
    let mut slug = String::with_capacity(branch.len());
    let mut previous_was_hyphen = true; // suppress a leading hyphen

    for ch in branch.chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' => Some(ch),
            'A'..='Z' => Some(ch.to_ascii_lowercase()),
            '/' | '_' | ' ' | '.' | '@' | '#' | '-' => None,
            _ => continue,
        };

        match mapped {
            Some(ch) => {
                slug.push(ch);
                previous_was_hyphen = false;
            }
            None => {
                if !previous_was_hyphen {
                    slug.push('-');
                    previous_was_hyphen = true;
                }
            }
        }
    }

    if slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Directory name for a worktree: the branch slug plus a short commit hash,
/// which keeps paths collision-resistant when a branch is re-created.
///
/// `feature/foo`, `a1b2c3d4e5f6` -> `feature-foo-a1b2c3d`
pub fn worktree_dir_name(branch: &str, sha: &str) -> String {
    let slug = slugify(branch);
    let short_sha = &sha[..sha.len().min(SHORT_SHA_LEN)];
    if short_sha.is_empty() {
        slug
    } else {
        format!("{slug}-{short_sha}")
    }
}

/// Branch name made safe for a tmux window: periods and colons are target
/// separators in tmux, so they and non-printable characters become
/// underscores. Never returns an empty name.
pub fn window_name(branch: &str) -> String {
    let sanitized: String = branch
        .chars()
        .map(|ch| match ch {
            '.' | ':' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();

    if sanitized.is_empty() {
        "unnamed".to_owned()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_replaces_separators_with_hyphens() {
        assert_eq!(slugify("feature/foo-bar"), "feature-foo-bar");
        assert_eq!(slugify("fix/auth bug"), "fix-auth-bug");
        assert_eq!(slugify("a_b.c@d#e"), "a-b-c-d-e");
    }

    #[test]
    fn slugify_lowercases_and_drops_exotic_characters() {
        assert_eq!(slugify("Feature/FOO"), "feature-foo");
        assert_eq!(slugify("fix/naïve!parser"), "fix-naveparser");
    }

    #[test]
    fn slugify_collapses_and_trims_hyphens() {
        assert_eq!(slugify("//double--sep//"), "double-sep");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn worktree_dir_name_appends_short_sha() {
        assert_eq!(
            worktree_dir_name("feature/foo", "a1b2c3d4e5f6"),
            "feature-foo-a1b2c3d"
        );
    }

    #[test]
    fn worktree_dir_name_keeps_short_shas_whole() {
        assert_eq!(worktree_dir_name("fix/x", "ab12"), "fix-x-ab12");
    }

    #[test]
    fn worktree_dir_name_without_sha_is_just_the_slug() {
        assert_eq!(worktree_dir_name("feature/foo", ""), "feature-foo");
    }

    #[test]
    fn window_name_replaces_tmux_target_separators() {
        assert_eq!(window_name("feature/foo.bar"), "feature/foo_bar");
        assert_eq!(window_name("fix:auth"), "fix_auth");
    }

    #[test]
    fn window_name_never_returns_empty() {
        assert_eq!(window_name(""), "unnamed");
    }
}
