
use rand::{thread_rng, Rng};

const RUNES_BASE64: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// RFC 5245 section 15.4: ufrag at least 4 characters, pwd at least 22.
const LEN_UFRAG: usize = 4;
const LEN_PWD: usize = 24;
const LEN_CAND_ID: usize = 8;

pub fn generate_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();

    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

/// Generates an ICE username fragment.
pub fn generate_ufrag() -> String {
    generate_random_string(LEN_UFRAG, RUNES_BASE64)
}

/// Generates an ICE password.
pub fn generate_pwd() -> String {
    generate_random_string(LEN_PWD, RUNES_BASE64)
}

/// Generates an opaque candidate identifier.
pub fn generate_cand_id() -> String {
    generate_random_string(LEN_CAND_ID, RUNES_BASE64)
}

/// Legacy signalling uses a different username for the RTCP component,
/// derived from the RTP one by replacing the last character with the next
/// character of the base64 alphabet (wrapping at the end).
pub fn rtcp_ufrag_from_rtp_ufrag(rtp_ufrag: &str) -> String {
    if rtp_ufrag.is_empty() {
        return String::new();
    }

    let mut chars: Vec<char> = rtp_ufrag.chars().collect();
    let last = *chars.last().unwrap() as u8;
    let next = match RUNES_BASE64.iter().position(|&c| c == last) {
        Some(pos) => RUNES_BASE64[(pos + 1) % RUNES_BASE64.len()],
        None => last,
    };
    *chars.last_mut().unwrap() = next as char;
    chars.into_iter().collect()
}
