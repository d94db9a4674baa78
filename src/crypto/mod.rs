// ABOUTME: Cryptographic helpers for secrets at rest
// ABOUTME: AES-256-GCM secret cipher with key derivation from a configured secret string
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

mod secrets;

pub use secrets::SecretCipher;
