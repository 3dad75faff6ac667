//! Token corpora and the window loaders that turn them into `(batch, seq_len)`
//! input/target pairs.

use std::{fs, path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokenizers::Tokenizer;

use crate::{config::BYTE_VOCAB_SIZE, TrainingError};

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Maps text to token ids and back.
#[derive(Clone)]
pub enum TextCodec {
    /// Every byte is a token.
    Bytes,
    Tokenizer(Arc<Tokenizer>),
}

impl TextCodec {
    pub fn from_tokenizer_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer json {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self::Tokenizer(Arc::new(tokenizer)))
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            TextCodec::Bytes => BYTE_VOCAB_SIZE,
            TextCodec::Tokenizer(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    /// Padding id configured in the tokenizer json, if any.
    pub fn pad_token_id(&self) -> Option<u32> {
        match self {
            TextCodec::Bytes => None,
            TextCodec::Tokenizer(tokenizer) => tokenizer.get_padding().map(|params| params.pad_id),
        }
    }

    pub fn encode_file(&self, path: &Path) -> Result<Vec<u32>> {
        match self {
            TextCodec::Bytes => {
                let bytes = fs::read(path).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to read corpus file {}: {err}",
                        path.display()
                    ))
                })?;
                Ok(bytes.into_iter().map(u32::from).collect())
            }
            TextCodec::Tokenizer(_) => {
                let text = fs::read_to_string(path).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to read corpus file {}: {err}",
                        path.display()
                    ))
                })?;
                self.encode(&text)
            }
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            TextCodec::Bytes => Ok(text.bytes().map(u32::from).collect()),
            TextCodec::Tokenizer(tokenizer) => tokenizer
                .encode(text, false)
                .map(|encoding| encoding.get_ids().to_vec())
                .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}"))),
        }
    }

    /// Lossy: bytes that do not form valid UTF-8 become replacement
    /// characters.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            TextCodec::Bytes => {
                let bytes: Vec<u8> = ids
                    .iter()
                    .map(|&id| u8::try_from(id).unwrap_or(b'?'))
                    .collect();
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            TextCodec::Tokenizer(tokenizer) => tokenizer
                .decode(ids, true)
                .map_err(|err| TrainingError::runtime(format!("detokenization failed: {err}"))),
        }
    }
}

impl std::fmt::Debug for TextCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextCodec::Bytes => f.write_str("Bytes"),
            TextCodec::Tokenizer(tokenizer) => f
                .debug_struct("Tokenizer")
                .field("vocab_size", &tokenizer.get_vocab_size(true))
                .finish(),
        }
    }
}

/// A flat stream of token ids.
#[derive(Debug, Clone)]
pub struct TokenCorpus {
    tokens: Vec<u32>,
}

impl TokenCorpus {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    /// Concatenates the encoded contents of `paths` in order.
    pub fn from_files<P: AsRef<Path>>(paths: &[P], codec: &TextCodec) -> Result<Self> {
        let mut tokens = Vec::new();
        for path in paths {
            tokens.extend(codec.encode_file(path.as_ref())?);
        }
        log::info!(
            "loaded {} token(s) from {} file(s)",
            tokens.len(),
            paths.len()
        );
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Holds out the trailing `fraction` of tokens; returns `(train, validation)`.
    pub fn split(self, fraction: f32) -> Result<(TokenCorpus, TokenCorpus)> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(TrainingError::initialization(format!(
                "validation fraction must be in [0, 1), got {fraction}"
            )));
        }
        let held_out = (self.tokens.len() as f64 * fraction as f64).round() as usize;
        let mut train = self.tokens;
        let validation = train.split_off(train.len() - held_out);
        Ok((TokenCorpus::new(train), TokenCorpus::new(validation)))
    }

    /// Number of non-overlapping `seq_len + 1` windows.
    pub fn window_count(&self, seq_len: usize) -> usize {
        if self.tokens.len() <= seq_len {
            0
        } else {
            (self.tokens.len() - 1) / seq_len
        }
    }

    fn window(&self, start: usize, seq_len: usize) -> &[u32] {
        &self.tokens[start..start + seq_len + 1]
    }
}

/// A micro-batch of shifted token windows.
#[derive(Debug)]
pub struct DataBatch {
    /// `(batch, seq_len)` u32 ids.
    pub inputs: Tensor,
    /// `inputs` shifted left by one position.
    pub targets: Tensor,
    pub micro_batch_index: usize,
    pub micro_batches_per_step: usize,
    pub global_step: usize,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_step_boundary(&self) -> bool {
        self.micro_batch_index + 1 == self.micro_batches_per_step
    }
}

pub trait DataLoader: Send {
    /// `Ok(None)` once the loader is exhausted.
    fn next_batch(&mut self) -> Result<Option<DataBatch>>;
}

fn stack_windows(
    corpus: &TokenCorpus,
    starts: &[usize],
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut flat = Vec::with_capacity(starts.len() * (seq_len + 1));
    for &start in starts {
        flat.extend_from_slice(corpus.window(start, seq_len));
    }
    let windows = Tensor::from_vec(flat, (starts.len(), seq_len + 1), device)?;
    let inputs = windows.narrow(1, 0, seq_len)?.contiguous()?;
    let targets = windows.narrow(1, 1, seq_len)?.contiguous()?;
    Ok((inputs, targets))
}

/// Samples uniformly placed windows forever, seeded for reproducibility.
///
/// Every optimizer step consumes `gradient_accumulation_steps` micro-batches
/// of `batch_size` windows.
pub struct RandomWindowLoader {
    corpus: Arc<TokenCorpus>,
    device: Device,
    seq_len: usize,
    batch_size: usize,
    micro_batches_per_step: usize,
    rng: StdRng,
    micro_batch_index: usize,
    global_step: usize,
    drawn: u64,
}

impl RandomWindowLoader {
    pub fn new(
        corpus: Arc<TokenCorpus>,
        device: Device,
        seq_len: usize,
        batch_size: usize,
        gradient_accumulation_steps: usize,
        seed: u64,
    ) -> Result<Self> {
        if seq_len == 0 || batch_size == 0 {
            return Err(TrainingError::initialization(
                "seq_len and batch_size must be greater than zero",
            ));
        }
        if corpus.len() <= seq_len {
            return Err(TrainingError::initialization(format!(
                "training corpus has {} token(s); at least {} are needed for seq_len {seq_len}",
                corpus.len(),
                seq_len + 1
            )));
        }
        Ok(Self {
            corpus,
            device,
            seq_len,
            batch_size,
            micro_batches_per_step: gradient_accumulation_steps.max(1),
            rng: StdRng::seed_from_u64(seed),
            micro_batch_index: 0,
            global_step: 0,
            drawn: 0,
        })
    }

    pub fn micro_batches_per_step(&self) -> usize {
        self.micro_batches_per_step
    }

    /// Micro-batches produced or skipped so far.
    pub fn micro_batches_drawn(&self) -> u64 {
        self.drawn
    }

    fn draw_starts(&mut self) -> Vec<usize> {
        let max_start = self.corpus.len() - self.seq_len - 1;
        (0..self.batch_size)
            .map(|_| self.rng.gen_range(0..=max_start))
            .collect()
    }

    fn advance(&mut self) -> (usize, usize) {
        let position = (self.micro_batch_index, self.global_step);
        self.drawn += 1;
        if self.micro_batch_index + 1 == self.micro_batches_per_step {
            self.micro_batch_index = 0;
            self.global_step += 1;
        } else {
            self.micro_batch_index += 1;
        }
        position
    }

    /// Replays `count` micro-batches of RNG draws without materialising them,
    /// restoring the stream position of a resumed run.
    pub fn skip(&mut self, count: u64) {
        for _ in 0..count {
            self.draw_starts();
            self.advance();
        }
    }
}

impl DataLoader for RandomWindowLoader {
    fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        let starts = self.draw_starts();
        let (inputs, targets) = stack_windows(&self.corpus, &starts, self.seq_len, &self.device)?;
        let (micro_batch_index, global_step) = self.advance();
        Ok(Some(DataBatch {
            inputs,
            targets,
            micro_batch_index,
            micro_batches_per_step: self.micro_batches_per_step,
            global_step,
        }))
    }
}

/// Walks non-overlapping windows from the start of the corpus. The final batch
/// may hold fewer than `batch_size` windows.
pub struct SequentialWindowLoader {
    corpus: Arc<TokenCorpus>,
    device: Device,
    seq_len: usize,
    batch_size: usize,
    next_window: usize,
    total_windows: usize,
    batches: usize,
}

impl SequentialWindowLoader {
    pub fn new(
        corpus: Arc<TokenCorpus>,
        device: Device,
        seq_len: usize,
        batch_size: usize,
    ) -> Result<Self> {
        if seq_len == 0 || batch_size == 0 {
            return Err(TrainingError::initialization(
                "seq_len and batch_size must be greater than zero",
            ));
        }
        let total_windows = corpus.window_count(seq_len);
        Ok(Self {
            corpus,
            device,
            seq_len,
            batch_size,
            next_window: 0,
            total_windows,
            batches: 0,
        })
    }

    pub fn total_windows(&self) -> usize {
        self.total_windows
    }
}

impl DataLoader for SequentialWindowLoader {
    fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        if self.next_window >= self.total_windows {
            return Ok(None);
        }
        let end = (self.next_window + self.batch_size).min(self.total_windows);
        let starts: Vec<usize> = (self.next_window..end)
            .map(|window| window * self.seq_len)
            .collect();
        self.next_window = end;

        let (inputs, targets) = stack_windows(&self.corpus, &starts, self.seq_len, &self.device)?;
        let global_step = self.batches;
        self.batches += 1;
        Ok(Some(DataBatch {
            inputs,
            targets,
            micro_batch_index: 0,
            micro_batches_per_step: 1,
            global_step,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_corpus(len: u32) -> Arc<TokenCorpus> {
        Arc::new(TokenCorpus::new((0..len).collect()))
    }

    #[test]
    fn split_holds_out_the_tail() {
        let (train, validation) = TokenCorpus::new((0..100).collect()).split(0.1).unwrap();
        assert_eq!(train.len(), 90);
        assert_eq!(validation.tokens(), &(90..100).collect::<Vec<u32>>()[..]);

        let (train, validation) = TokenCorpus::new(vec![1, 2, 3]).split(0.0).unwrap();
        assert_eq!(train.len(), 3);
        assert!(validation.is_empty());
    }

    #[test]
    fn byte_codec_round_trips_utf8() {
        let codec = TextCodec::Bytes;
        let ids = codec.encode("héllo").unwrap();
        assert_eq!(ids.len(), 6);
        assert!(ids.iter().all(|&id| id < 256));
        assert_eq!(codec.decode(&ids).unwrap(), "héllo");
    }

    #[test]
    fn random_windows_are_shifted_pairs() {
        let mut loader =
            RandomWindowLoader::new(counting_corpus(50), Device::Cpu, 8, 3, 2, 11).unwrap();
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.inputs.dims(), &[3, 8]);
        let inputs = batch.inputs.to_vec2::<u32>().unwrap();
        let targets = batch.targets.to_vec2::<u32>().unwrap();
        for (row_in, row_out) in inputs.iter().zip(targets.iter()) {
            for (a, b) in row_in.iter().zip(row_out.iter()) {
                assert_eq!(a + 1, *b);
            }
            assert!(*row_out.last().unwrap() < 50);
        }
    }

    #[test]
    fn accumulation_positions_cycle() {
        let mut loader =
            RandomWindowLoader::new(counting_corpus(64), Device::Cpu, 4, 1, 3, 0).unwrap();
        let positions: Vec<(usize, usize, bool)> = (0..6)
            .map(|_| {
                let batch = loader.next_batch().unwrap().unwrap();
                (batch.micro_batch_index, batch.global_step, batch.is_step_boundary())
            })
            .collect();
        assert_eq!(
            positions,
            vec![
                (0, 0, false),
                (1, 0, false),
                (2, 0, true),
                (0, 1, false),
                (1, 1, false),
                (2, 1, true)
            ]
        );
    }

    #[test]
    fn skip_reproduces_the_stream() {
        let corpus = counting_corpus(500);
        let mut reference =
            RandomWindowLoader::new(corpus.clone(), Device::Cpu, 16, 2, 1, 5).unwrap();
        for _ in 0..4 {
            reference.next_batch().unwrap();
        }
        let expected = reference.next_batch().unwrap().unwrap();

        let mut resumed = RandomWindowLoader::new(corpus, Device::Cpu, 16, 2, 1, 5).unwrap();
        resumed.skip(4);
        assert_eq!(resumed.micro_batches_drawn(), 4);
        let actual = resumed.next_batch().unwrap().unwrap();
        assert_eq!(
            expected.inputs.to_vec2::<u32>().unwrap(),
            actual.inputs.to_vec2::<u32>().unwrap()
        );
        assert_eq!(actual.global_step, 4);
    }

    #[test]
    fn short_corpus_is_rejected() {
        assert!(RandomWindowLoader::new(counting_corpus(8), Device::Cpu, 8, 1, 1, 0).is_err());
    }

    #[test]
    fn sequential_loader_covers_each_window_once() {
        let mut loader = SequentialWindowLoader::new(counting_corpus(26), Device::Cpu, 5, 2).unwrap();
        assert_eq!(loader.total_windows(), 5);
        let mut rows = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            rows.extend(batch.inputs.to_vec2::<u32>().unwrap());
        }
        let firsts: Vec<u32> = rows.iter().map(|row| row[0]).collect();
        assert_eq!(firsts, vec![0, 5, 10, 15, 20]);
    }
}
