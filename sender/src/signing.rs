use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Signs a tracked link so a recipient can't be coerced into visiting an
/// arbitrary URL through the redirect endpoint (§4.5 step 4, §4.9).
/// `key` is the per-campaign `signature_key`; `payload` is the raw
/// (unencoded) destination URL.
pub fn sign(key: &[u8], payload: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Verifies a signature produced by [`sign`] in constant time.
pub fn verify(key: &[u8], payload: &str, signature: &str) -> bool {
    let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };

    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();

    expected.ct_eq(&provided).into()
}
