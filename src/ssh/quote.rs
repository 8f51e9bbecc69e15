// ABOUTME: POSIX shell quoting for arguments embedded in remote command strings.
// ABOUTME: Remote commands travel as a single string interpreted by the login shell.

use std::borrow::Cow;

/// Quote `arg` so a POSIX shell passes it through as one literal word.
pub fn quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:@%+=,".contains(&b));
    if safe {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_pass_through() {
        assert_eq!(quote("/home/deploy/file.txt"), "/home/deploy/file.txt");
        assert_eq!(quote("db.internal"), "db.internal");
    }

    #[test]
    fn empty_and_spaced_words_are_quoted() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("my dir"), "'my dir'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
