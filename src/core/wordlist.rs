//! Word suffixes for wormhole codes.
//!
//! Code generation only needs some stable injection from channel ids to short
//! strings; the real secret is the code as a whole. Applications with their
//! own encoding (different languages, different lists) implement [`CodeWords`]
//! and install it with `Wormhole::set_wordlist`.

use sha2::{Digest, Sha256};

/// Supplies the word suffix of a wormhole code for a freshly allocated
/// channel. The result must be deterministic: both the minting side and any
/// tooling around it (completion, transcription checks) rely on the same
/// channel id always producing the same words.
pub trait CodeWords {
    /// The dash-joined suffix for `channel_id`, made of `words` words.
    fn suffix(&self, channel_id: u32, words: usize) -> String;
}

// Alternating even/odd tables, so consecutive words never come from the same
// list and transcription errors stay easy to spot.
const EVEN_WORDS: &[&str] = &[
    "acme", "adult", "ahead", "aimless", "apple", "atlas", "basin", "beaming", "bison", "braggart",
    "button", "chisel", "clamshell", "cobra", "crucial", "deckhand", "dragnet", "drumbeat",
    "edict", "eyetooth", "facial", "flagpole", "gazelle", "glitter", "hamlet", "indoors",
    "indulge", "island", "keyboard", "klaxon", "locale", "lockup",
];

const ODD_WORDS: &[&str] = &[
    "adroitness", "adviser", "aggregate", "alkali", "almighty", "amulet", "antenna", "applicant",
    "armistice", "article", "asteroid", "atmosphere", "autopsy", "babylon", "backwater",
    "barbecue", "belowground", "bifocals", "bodyguard", "bookseller", "borderline", "bottomless",
    "bracketed", "candidate", "cannonball", "celebrate", "cellulose", "certify", "chambermaid",
    "cherokee", "clergyman", "coherence",
];

/// The built-in word list: words picked by hashing the channel id, so the
/// suffix is a pure function of the id.
#[derive(Default)]
pub struct Wordlist {}

impl Wordlist {
    fn pick(&self, channel_id: u32, index: usize) -> &'static str {
        let list = if index % 2 == 0 { EVEN_WORDS } else { ODD_WORDS };
        let digest = Sha256::new_with_prefix(b"wormhole-code")
            .chain_update(channel_id.to_be_bytes())
            .chain_update((index as u32).to_be_bytes())
            .finalize();
        list[usize::from(digest[0]) % list.len()]
    }
}

impl CodeWords for Wordlist {
    fn suffix(&self, channel_id: u32, words: usize) -> String {
        (0..words)
            .map(|index| self.pick(channel_id, index))
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_suffix_is_deterministic() {
        let wordlist = Wordlist::default();
        assert_eq!(wordlist.suffix(42, 2), wordlist.suffix(42, 2));
        assert_eq!(wordlist.suffix(999_999, 3), wordlist.suffix(999_999, 3));
    }

    #[test]
    fn test_suffix_has_requested_word_count() {
        let wordlist = Wordlist::default();
        for words in 1..=4 {
            let suffix = wordlist.suffix(7, words);
            assert_eq!(suffix.split('-').count(), words);
            assert!(suffix.split('-').all(|word| !word.is_empty()));
        }
    }

    #[test]
    fn test_prefix_words_are_stable_across_lengths() {
        let wordlist = Wordlist::default();
        let two = wordlist.suffix(123, 2);
        let three = wordlist.suffix(123, 3);
        assert!(three.starts_with(&two));
    }
}
