/// Hashing of dumped images
///
/// Images can be large, so every requested digest is computed in a single
/// read pass over the file.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_CHUNK: usize = 1024 * 1024;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    MD5,
    SHA1,
    SHA256,
    SHA512,
}

impl HashAlgorithm {
    pub fn all() -> Vec<Self> {
        vec![Self::MD5, Self::SHA1, Self::SHA256, Self::SHA512]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MD5 => "MD5",
            Self::SHA1 => "SHA1",
            Self::SHA256 => "SHA256",
            Self::SHA512 => "SHA512",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::MD5),
            "sha1" => Ok(Self::SHA1),
            "sha256" => Ok(Self::SHA256),
            "sha512" => Ok(Self::SHA512),
            other => Err(format!("Unknown hash algorithm: {}", other)),
        }
    }
}

/// Digest of a whole image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageHash {
    pub algorithm: HashAlgorithm,
    /// Lowercase hexadecimal digest
    pub hash: String,
    pub image_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_at: Option<chrono::DateTime<chrono::Utc>>,
}

enum Hasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::MD5 => Hasher::Md5(md5::Context::new()),
            HashAlgorithm::SHA1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::SHA256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::SHA512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha1(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Hash an image with every algorithm in `algorithms`, reading it once
pub fn hash_image(
    path: impl AsRef<Path>,
    algorithms: &[HashAlgorithm],
) -> io::Result<Vec<ImageHash>> {
    let mut file = File::open(path.as_ref())?;
    let image_size = file.metadata()?.len();

    let mut hashers: Vec<(HashAlgorithm, Hasher)> = algorithms
        .iter()
        .map(|&algorithm| (algorithm, Hasher::new(algorithm)))
        .collect();

    let mut buffer = vec![0; READ_CHUNK];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buffer[..n]);
        }
    }

    let calculated_at = Some(chrono::Utc::now());
    Ok(hashers
        .into_iter()
        .map(|(algorithm, hasher)| ImageHash {
            algorithm,
            hash: hasher.finish(),
            image_size,
            calculated_at,
        })
        .collect())
}

/// Check an image against a reference digest
pub fn verify_image_hash(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
    expected: &str,
) -> io::Result<bool> {
    let hashes = hash_image(path, &[algorithm])?;
    Ok(hashes
        .first()
        .is_some_and(|h| h.hash.eq_ignore_ascii_case(expected)))
}
