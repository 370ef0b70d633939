//! Symmetric file encryption for manifests and archives.
//!
//! Encrypted files carry the `.enc` suffix and are laid out as a 16-byte
//! random IV followed by AES-256-CBC ciphertext (PKCS#7 padding). The key is
//! SHA-256 of the operator passphrase, so any later run can re-derive it.
//! Losing the passphrase means losing the data; there is no escrow.

use crate::fs::walker::PARTIAL_SUFFIX;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Suffix marking an encrypted artifact.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Name of the side-channel file written by [`write_recovery_key`].
pub const RECOVERY_KEY_FILE: &str = "RECOVERY_KEY.txt";

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("{0}")]
    Decryption(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Derive the 256-bit key for a passphrase.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Whether a path names an encrypted artifact.
pub fn is_encrypted(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(ENCRYPTED_SUFFIX))
        .unwrap_or(false)
}

/// Path the encrypted copy of `path` is written to.
pub fn encrypted_path(path: &Path) -> PathBuf {
    with_suffix(path, ENCRYPTED_SUFFIX)
}

/// Encrypt `path` into `<path>.enc`, leaving the source untouched.
pub fn encrypt_file(path: &Path, passphrase: &str) -> Result<PathBuf, CryptoError> {
    let source = open_existing(path)?;
    let output = encrypted_path(path);

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new(&derive_key(passphrase).into(), &iv.into());

    let mut reader = BufReader::new(source);
    write_atomically(&output, |writer| {
        writer.write_all(&iv)?;
        encrypt_stream(cipher, &mut reader, writer)
    })?;

    tracing::debug!(path = %output.display(), "Encrypted file");
    Ok(output)
}

/// Decrypt an `.enc` file into `output`.
///
/// A wrong passphrase surfaces as [`CryptoError::Decryption`] through the
/// padding check; nothing is left at `output` on failure.
pub fn decrypt_file(path: &Path, output: &Path, passphrase: &str) -> Result<PathBuf, CryptoError> {
    let mut reader = BufReader::new(open_existing(path)?);

    let mut iv = [0u8; IV_LEN];
    reader.read_exact(&mut iv).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            CryptoError::Decryption("file is too short to contain an IV".to_string())
        }
        _ => CryptoError::Io(e),
    })?;
    let cipher = Aes256CbcDec::new(&derive_key(passphrase).into(), &iv.into());

    write_atomically(output, |writer| decrypt_stream(cipher, &mut reader, writer))?;

    tracing::debug!(path = %output.display(), "Decrypted file");
    Ok(output.to_path_buf())
}

/// Write the passphrase to `dir/RECOVERY_KEY.txt` for disaster recovery.
///
/// This is the only place key material is persisted in plaintext and only
/// runs when an operator asks for it.
pub fn write_recovery_key(passphrase: &str, dir: &Path) -> Result<PathBuf, CryptoError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(RECOVERY_KEY_FILE);
    let contents = format!(
        "Backup encryption passphrase (store offline, then delete this file):\n{}\n",
        passphrase
    );
    write_atomically(&path, |writer| {
        writer.write_all(contents.as_bytes())?;
        Ok(())
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    tracing::warn!(path = %path.display(), "Wrote plaintext recovery key");
    Ok(path)
}

fn encrypt_stream<R: Read, W: Write>(
    mut cipher: Aes256CbcEnc,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), CryptoError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut filled = 0usize;

    loop {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;

        let whole = filled - filled % BLOCK_LEN;
        for block in buf[..whole].chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&buf[..whole])?;
        buf.copy_within(whole..filled, 0);
        filled -= whole;
    }

    // Remainder is < one block; PKCS#7 always emits exactly one more block.
    let mut last = [0u8; BLOCK_LEN];
    last[..filled].copy_from_slice(&buf[..filled]);
    let tail = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut last, filled)
        .map_err(|_| io::Error::other("padding buffer too small"))?;
    writer.write_all(tail)?;
    Ok(())
}

fn decrypt_stream<R: Read, W: Write>(
    mut cipher: Aes256CbcDec,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), CryptoError> {
    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_LEN];
    let mut filled = 0usize;

    loop {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;

        // The final block carries the padding, so always hold one back.
        if filled > BLOCK_LEN {
            let ready = ((filled - 1) / BLOCK_LEN) * BLOCK_LEN;
            for block in buf[..ready].chunks_exact_mut(BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf[..ready])?;
            buf.copy_within(ready..filled, 0);
            filled -= ready;
        }
    }

    if filled != BLOCK_LEN {
        return Err(CryptoError::Decryption(
            "ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    let plain = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf[..BLOCK_LEN])
        .map_err(|_| CryptoError::Decryption("invalid padding (wrong passphrase?)".to_string()))?;
    writer.write_all(plain)?;
    Ok(())
}

/// Run `write` against `<dest>.part` and rename into place only on success.
fn write_atomically<F>(dest: &Path, write: F) -> Result<(), CryptoError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), CryptoError>,
{
    let part = with_suffix(dest, PARTIAL_SUFFIX);
    let result = write_part(&part, write).and_then(|_| fs::rename(&part, dest).map_err(Into::into));
    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

fn write_part<F>(part: &Path, write: F) -> Result<(), CryptoError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), CryptoError>,
{
    let mut writer = BufWriter::new(File::create(part)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn open_existing(path: &Path) -> Result<File, CryptoError> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CryptoError::NotFound(path.to_path_buf()),
        _ => CryptoError::Io(e),
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn round_trip(len: usize) -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("data.bin");
        let plaintext: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&source, &plaintext)?;

        let encrypted = encrypt_file(&source, "correct horse").unwrap();
        assert_eq!(encrypted, dir.path().join("data.bin.enc"));
        assert_eq!(fs::read(&source)?, plaintext, "source must be untouched");

        let raw = fs::read(&encrypted)?;
        assert_eq!(raw.len(), IV_LEN + (len / BLOCK_LEN + 1) * BLOCK_LEN);

        let restored = dir.path().join("restored.bin");
        decrypt_file(&encrypted, &restored, "correct horse").unwrap();
        assert_eq!(fs::read(&restored)?, plaintext, "length {}", len);
        Ok(())
    }

    #[test]
    fn test_round_trip_various_lengths() -> std::io::Result<()> {
        for len in [0, 1, 15, 16, 17, 4096, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 200_000] {
            round_trip(len)?;
        }
        Ok(())
    }

    #[test]
    fn test_wrong_passphrase_never_yields_plaintext() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("manifest.json");
        let plaintext = br#"{"totalAssets":5,"assets":[]}"#.repeat(40);
        fs::write(&source, &plaintext)?;
        let encrypted = encrypt_file(&source, "right").unwrap();

        let output = dir.path().join("out.json");
        match decrypt_file(&encrypted, &output, "wrong") {
            Err(CryptoError::Decryption(_)) => {
                assert!(!output.exists(), "no partial output on failure");
                assert!(!dir.path().join("out.json.part").exists());
            }
            Err(other) => panic!("unexpected error: {other}"),
            // PKCS#7 alone lets roughly 1 in 256 wrong keys through.
            Ok(_) => assert_ne!(fs::read(&output)?, plaintext),
        }
        Ok(())
    }

    #[test]
    fn test_missing_input_is_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.zip");
        assert!(matches!(encrypt_file(&missing, "pw"), Err(CryptoError::NotFound(_))));
        assert!(matches!(
            decrypt_file(&missing, &dir.path().join("x"), "pw"),
            Err(CryptoError::NotFound(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_is_rejected() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("a.txt");
        fs::write(&source, vec![7u8; 100])?;
        let encrypted = encrypt_file(&source, "pw").unwrap();

        let mut raw = fs::read(&encrypted)?;
        raw.truncate(raw.len() - 5);
        fs::write(&encrypted, &raw)?;

        let out = dir.path().join("a.out");
        assert!(matches!(decrypt_file(&encrypted, &out, "pw"), Err(CryptoError::Decryption(_))));
        assert!(!out.exists());

        fs::write(&encrypted, [1u8; 10])?;
        assert!(matches!(decrypt_file(&encrypted, &out, "pw"), Err(CryptoError::Decryption(_))));
        Ok(())
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        assert_eq!(derive_key("passphrase"), derive_key("passphrase"));
        assert_ne!(derive_key("passphrase"), derive_key("passphrase2"));
    }

    #[test]
    fn test_each_encryption_uses_a_fresh_iv() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("same.txt");
        fs::write(&source, b"identical content")?;

        let first = fs::read(encrypt_file(&source, "pw").unwrap())?;
        let second = fs::read(encrypt_file(&source, "pw").unwrap())?;
        assert_ne!(first[..IV_LEN], second[..IV_LEN]);
        Ok(())
    }

    #[test]
    fn test_is_encrypted_checks_suffix() {
        assert!(is_encrypted(Path::new("/b/cloudinary_backup_1.zip.enc")));
        assert!(!is_encrypted(Path::new("/b/cloudinary_backup_1.zip")));
    }

    #[test]
    fn test_recovery_key_file() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = write_recovery_key("s3cret", &dir.path().join("keys")).unwrap();
        assert_eq!(path.file_name().unwrap(), RECOVERY_KEY_FILE);
        assert!(fs::read_to_string(&path)?.contains("s3cret"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        }
        Ok(())
    }
}
