use rand::RngCore;

const PASSWORD_BYTES: usize = 24;

/// 24 random bytes in base64, with `+` and `/` swapped for `0` and `1` so
/// the password survives unescaped in connection URLs.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes).replace('+', "0").replace('/', "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works_on_password_alphabet() {
        let password = generate_password();
        assert_eq!(32, password.len());
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password());
    }
}
