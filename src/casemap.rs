//! IRC case-mapping strategies.
//!
//! IRC servers declare (via `ISUPPORT CASEMAPPING`) how nicknames and
//! channel names compare. The `rfc1459` mapping treats `{}|^` as the
//! lower-case forms of `[]\~` in addition to ordinary ASCII folding; the
//! `ascii` mapping does not.

use std::str::FromStr;

/// A case-comparison/conversion strategy.
///
/// Canonical form is the RFC's upper-case form, so under [`Rfc1459`]
/// `{`, `|`, `}` and `^` fold to `[`, `\`, `]` and `~`.
///
/// [`Rfc1459`]: Casemapping::Rfc1459
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Casemapping {
    /// Plain ASCII case folding.
    Ascii,
    /// RFC 1459 folding: ASCII plus the bracket equivalences.
    #[default]
    Rfc1459,
}

impl Casemapping {
    /// Fold a single character to its canonical form.
    pub fn fold_char(self, c: char) -> char {
        match (self, c) {
            (Casemapping::Rfc1459, '{') => '[',
            (Casemapping::Rfc1459, '|') => '\\',
            (Casemapping::Rfc1459, '}') => ']',
            (Casemapping::Rfc1459, '^') => '~',
            (_, 'a'..='z') => c.to_ascii_uppercase(),
            _ => c,
        }
    }

    /// Fold a string to its canonical form.
    pub fn fold(self, s: &str) -> String {
        s.chars().map(|c| self.fold_char(c)).collect()
    }

    /// Compare two strings for equality under this mapping.
    pub fn eq(self, a: &str, b: &str) -> bool {
        if a.len() != b.len() {
            // Folding never changes byte length for these mappings.
            return false;
        }
        a.chars()
            .zip(b.chars())
            .all(|(ca, cb)| self.fold_char(ca) == self.fold_char(cb))
    }

    /// The token this mapping is advertised as in `ISUPPORT CASEMAPPING`.
    pub fn token(self) -> &'static str {
        match self {
            Casemapping::Ascii => "ascii",
            Casemapping::Rfc1459 => "rfc1459",
        }
    }
}

/// Parsed from an `ISUPPORT CASEMAPPING` value. Unrecognized values are an
/// error; the negotiator falls back to `rfc1459` with a warning.
impl FromStr for Casemapping {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ascii") {
            Ok(Casemapping::Ascii)
        } else if s.eq_ignore_ascii_case("rfc1459") {
            Ok(Casemapping::Rfc1459)
        } else {
            Err(())
        }
    }
}
