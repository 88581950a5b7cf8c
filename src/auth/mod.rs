use sha2::{Digest, Sha256};

/// Iterated-hash credential for the password challenge carried by the
/// handshake. The first round digests `password + nonce` as UTF-8 text; every
/// following round digests the raw bytes of the previous digest, for
/// `iterations` digest applications in total. Brokers that omit the iteration
/// count get a single application.
pub fn hashed_password(password: &str, nonce: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{password}{nonce}").as_bytes());
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(&digest);
    }
    hex::encode(digest)
}
