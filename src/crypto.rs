//! Passphrase key schedule and per-chunk AES-128-CBC encryption with
//! ciphertext stealing.
//!
//! Every chunk is encrypted under its own key and IV, derived from the
//! container's passphrase hashes plus an 8-byte random salt stored next to
//! the chunk. Ciphertext stealing keeps the ciphertext exactly as long as
//! the plaintext, so chunk sizes on disk never betray the cipher block size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::error::StreamError;

const HASH_LEN: usize = 64; // SHA-512 digest width
/// Per-chunk salt width on disk.
pub const SALT_LEN: usize = 8;
const CBC_LEN: usize = 16; // AES block width

/// Passphrase-derived key material shared by every chunk of a container.
///
/// `pass_hash` is the straight digest of the passphrase. `hash` is the same
/// digest folded over itself `encloops` times, which prices a brute-force
/// attempt at `encloops` hashes per guess. Both stay full SHA-512 width;
/// truncation to the AES key size happens per chunk, after salting.
pub struct KeySchedule {
    pass_hash: [u8; HASH_LEN],
    hash: [u8; HASH_LEN],
}

impl KeySchedule {
    pub fn new(passphrase: &[u8], encloops: u64) -> Result<Self, StreamError> {
        if passphrase.is_empty() {
            return Err(StreamError::Crypto("empty passphrase".into()));
        }
        let mut pass_hash = [0u8; HASH_LEN];
        pass_hash.copy_from_slice(&Sha512::digest(passphrase));

        debug!("hashing passphrase {} times", encloops);
        let mut hash = [0u8; HASH_LEN];
        for _ in 0..encloops {
            for j in 0..HASH_LEN {
                hash[j] ^= pass_hash[j];
            }
            let digest = Sha512::digest(hash);
            hash.copy_from_slice(&digest);
        }
        Ok(KeySchedule { pass_hash, hash })
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.pass_hash.zeroize();
        self.hash.zeroize();
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule").finish_non_exhaustive()
    }
}

/// Fresh 8-byte salt for one chunk.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the chunk key and IV:
/// `key = SHA-512((pass_hash XOR hash) || salt)`,
/// `iv = SHA-512((key XOR pass_hash) || salt)`, each truncated to 16 bytes.
fn derive_key_iv(ks: &KeySchedule, salt: &[u8; SALT_LEN]) -> ([u8; CBC_LEN], [u8; CBC_LEN]) {
    let mut material = [0u8; HASH_LEN + SALT_LEN];
    for i in 0..HASH_LEN {
        material[i] = ks.pass_hash[i] ^ ks.hash[i];
    }
    material[HASH_LEN..].copy_from_slice(salt);
    let mut key_hash = [0u8; HASH_LEN];
    key_hash.copy_from_slice(&Sha512::digest(material));

    for i in 0..HASH_LEN {
        material[i] = key_hash[i] ^ ks.pass_hash[i];
    }
    material[HASH_LEN..].copy_from_slice(salt);
    let mut iv_hash = [0u8; HASH_LEN];
    iv_hash.copy_from_slice(&Sha512::digest(material));

    let mut key = [0u8; CBC_LEN];
    key.copy_from_slice(&key_hash[..CBC_LEN]);
    let mut iv = [0u8; CBC_LEN];
    iv.copy_from_slice(&iv_hash[..CBC_LEN]);

    material.zeroize();
    key_hash.zeroize();
    iv_hash.zeroize();
    (key, iv)
}

/// Encrypt a chunk payload in place under its per-chunk salt.
pub(crate) fn encrypt_chunk(ks: &KeySchedule, salt: &[u8; SALT_LEN], buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let (mut key, iv) = derive_key_iv(ks, salt);
    cts_encrypt(&key, iv, buf);
    key.zeroize();
}

/// Decrypt a chunk payload in place under its per-chunk salt.
pub(crate) fn decrypt_chunk(ks: &KeySchedule, salt: &[u8; SALT_LEN], buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let (mut key, iv) = derive_key_iv(ks, salt);
    cts_decrypt(&key, iv, buf);
    key.zeroize();
}

fn xor_block(a: &mut [u8], b: &[u8]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
}

/// CBC over whole blocks, leaving `iv` holding the last ciphertext block so
/// a trailing partial block can continue the chain.
fn cbc_encrypt_in_place(cipher: &Aes128, iv: &mut [u8; CBC_LEN], data: &mut [u8]) {
    for block in data.chunks_exact_mut(CBC_LEN) {
        xor_block(block, iv);
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        iv.copy_from_slice(block);
    }
}

/// Inverse of [`cbc_encrypt_in_place`]; `iv` ends up holding the last input
/// ciphertext block.
fn cbc_decrypt_in_place(cipher: &Aes128, iv: &mut [u8; CBC_LEN], data: &mut [u8]) {
    for block in data.chunks_exact_mut(CBC_LEN) {
        let mut saved = [0u8; CBC_LEN];
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        xor_block(block, iv);
        iv.copy_from_slice(&saved);
    }
}

/// AES-128-CBC with ciphertext stealing, in place. The output is exactly
/// `buf.len()` bytes for every input length.
///
/// With a trailing partial block of `m` bytes, the partial block is
/// zero-padded, encrypted as one more CBC block, and swapped with the last
/// full ciphertext block: the old full block donates its first `m` bytes to
/// the tail and the fresh block takes its place. Inputs shorter than one
/// block have no full block to steal from, so they are XORed with the
/// encrypted IV instead (single-block CFB), which is equally invertible.
pub(crate) fn cts_encrypt(key: &[u8; CBC_LEN], iv: [u8; CBC_LEN], buf: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let len = buf.len();
    let mut iv = iv;

    if len < CBC_LEN {
        let mut pad = iv;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut pad));
        xor_block(buf, &pad[..len]);
        pad.zeroize();
        return;
    }

    let m = len % CBC_LEN;
    let n = len - m;
    cbc_encrypt_in_place(&cipher, &mut iv, &mut buf[..n]);
    if m > 0 {
        let mut tail = [0u8; CBC_LEN];
        tail[..m].copy_from_slice(&buf[n..]);
        xor_block(&mut tail, &iv);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut tail));
        // Swap: the last full ciphertext block donates its head to the tail
        // position and the fresh block lands where the full block was.
        let (head, stub) = buf.split_at_mut(n);
        stub.copy_from_slice(&head[n - CBC_LEN..n - CBC_LEN + m]);
        head[n - CBC_LEN..].copy_from_slice(&tail);
    }
}

/// Exact inverse of [`cts_encrypt`].
pub(crate) fn cts_decrypt(key: &[u8; CBC_LEN], iv: [u8; CBC_LEN], buf: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let len = buf.len();
    let mut iv = iv;

    if len < CBC_LEN {
        let mut pad = iv;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut pad));
        xor_block(buf, &pad[..len]);
        pad.zeroize();
        return;
    }

    let m = len % CBC_LEN;
    let n = len - m;
    if m > 0 {
        // Plain CBC up to the stolen pair; `iv` then holds the chain value
        // the pair was encrypted against.
        cbc_decrypt_in_place(&cipher, &mut iv, &mut buf[..n - CBC_LEN]);

        let mut scratch = [0u8; CBC_LEN];
        scratch.copy_from_slice(&buf[n - CBC_LEN..n]);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut scratch));

        let mut stolen = [0u8; CBC_LEN];
        stolen[..m].copy_from_slice(&buf[n..]);
        xor_block(&mut scratch, &stolen);
        buf[n..].copy_from_slice(&scratch[..m]);

        stolen[m..].copy_from_slice(&scratch[m..]);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut stolen));
        xor_block(&mut stolen, &iv);
        buf[n - CBC_LEN..n].copy_from_slice(&stolen);
    } else {
        cbc_decrypt_in_place(&cipher, &mut iv, buf);
    }
}
