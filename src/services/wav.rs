/// RIFF/WAVE PCM files for chapter intermediates and the master stream.
///
/// Two layouts are supported, matching the adapter contract: 16-bit integer
/// PCM (format tag 1) and 32-bit IEEE float (format tag 3, with the
/// customary `fact` chunk). Samples are interleaved little-endian. The
/// writer patches its size fields on finalize; the reader streams frames in
/// bounded chunks so assembly never materializes a whole book.
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ConversionError, Result};
use crate::models::{AudioFormat, PcmBuffer, SampleData, SampleFormat};

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;

pub struct WavWriter {
    file: BufWriter<File>,
    format: AudioFormat,
    data_bytes: u64,
    path: PathBuf,
}

impl WavWriter {
    pub fn create(path: &Path, format: AudioFormat) -> Result<Self> {
        let file = File::create(path).map_err(|e| ConversionError::io(path, e))?;
        let mut writer = WavWriter {
            file: BufWriter::new(file),
            format,
            data_bytes: 0,
            path: path.to_path_buf(),
        };
        writer.write_header().map_err(|e| ConversionError::io(path, e))?;
        Ok(writer)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frames_written(&self) -> u64 {
        let frame_bytes =
            self.format.sample_format.bytes_per_sample() as u64 * self.format.channels as u64;
        self.data_bytes / frame_bytes
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        let bits = (self.format.sample_format.bytes_per_sample() * 8) as u16;
        let block_align = self.format.channels * bits / 8;
        let byte_rate = self.format.sample_rate * block_align as u32;
        let format_tag = match self.format.sample_format {
            SampleFormat::Int16 => FORMAT_PCM,
            SampleFormat::Float32 => FORMAT_IEEE_FLOAT,
        };

        self.file.write_all(b"RIFF")?;
        self.file.write_u32::<LittleEndian>(0)?; // patched on finalize
        self.file.write_all(b"WAVE")?;

        self.file.write_all(b"fmt ")?;
        self.file.write_u32::<LittleEndian>(16)?;
        self.file.write_u16::<LittleEndian>(format_tag)?;
        self.file.write_u16::<LittleEndian>(self.format.channels)?;
        self.file.write_u32::<LittleEndian>(self.format.sample_rate)?;
        self.file.write_u32::<LittleEndian>(byte_rate)?;
        self.file.write_u16::<LittleEndian>(block_align)?;
        self.file.write_u16::<LittleEndian>(bits)?;

        if format_tag == FORMAT_IEEE_FLOAT {
            self.file.write_all(b"fact")?;
            self.file.write_u32::<LittleEndian>(4)?;
            self.file.write_u32::<LittleEndian>(0)?; // patched on finalize
        }

        self.file.write_all(b"data")?;
        self.file.write_u32::<LittleEndian>(0)?; // patched on finalize
        Ok(())
    }

    /// Append interleaved samples. The sample type must match the file's
    /// declared format.
    pub fn write_samples(&mut self, data: &SampleData) -> Result<()> {
        let result = match (self.format.sample_format, data) {
            (SampleFormat::Int16, SampleData::Int16(samples)) => {
                let mut bytes = 0u64;
                let mut r = Ok(());
                for &s in samples {
                    if let Err(e) = self.file.write_i16::<LittleEndian>(s) {
                        r = Err(e);
                        break;
                    }
                    bytes += 2;
                }
                self.data_bytes += bytes;
                r
            }
            (SampleFormat::Float32, SampleData::Float32(samples)) => {
                let mut bytes = 0u64;
                let mut r = Ok(());
                for &s in samples {
                    if let Err(e) = self.file.write_f32::<LittleEndian>(s) {
                        r = Err(e);
                        break;
                    }
                    bytes += 4;
                }
                self.data_bytes += bytes;
                r
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "sample type does not match the file format",
            )),
        };
        result.map_err(|e| ConversionError::io(&self.path, e))
    }

    /// Patch the header sizes and flush. Returns the frame count.
    pub fn finalize(mut self) -> Result<u64> {
        let frames = self.frames_written();
        let path = self.path.clone();
        self.patch_sizes(frames)
            .map_err(|e| ConversionError::io(&path, e))?;
        Ok(frames)
    }

    fn patch_sizes(&mut self, frames: u64) -> std::io::Result<()> {
        self.file.flush()?;
        let file = self.file.get_mut();

        let has_fact = self.format.sample_format == SampleFormat::Float32;
        let data_offset: u64 = if has_fact { 56 } else { 44 };
        let riff_size = (data_offset - 8 + self.data_bytes) as u32;

        file.seek(SeekFrom::Start(4))?;
        file.write_u32::<LittleEndian>(riff_size)?;
        if has_fact {
            file.seek(SeekFrom::Start(44))?;
            file.write_u32::<LittleEndian>(frames as u32)?;
        }
        file.seek(SeekFrom::Start(data_offset - 4))?;
        file.write_u32::<LittleEndian>(self.data_bytes as u32)?;
        file.flush()
    }
}

pub struct WavReader {
    file: BufReader<File>,
    format: AudioFormat,
    frames_total: u64,
    frames_read: u64,
    path: PathBuf,
}

impl WavReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ConversionError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let (format, data_bytes) =
            Self::read_header(&mut reader).map_err(|e| ConversionError::io(path, e))?;
        let frame_bytes =
            format.sample_format.bytes_per_sample() as u64 * format.channels as u64;
        Ok(WavReader {
            file: reader,
            format,
            frames_total: data_bytes / frame_bytes,
            frames_read: 0,
            path: path.to_path_buf(),
        })
    }

    fn read_header(file: &mut BufReader<File>) -> std::io::Result<(AudioFormat, u64)> {
        let bad = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

        let mut tag = [0u8; 4];
        file.read_exact(&mut tag)?;
        if &tag != b"RIFF" {
            return Err(bad("not a RIFF file"));
        }
        file.read_u32::<LittleEndian>()?;
        file.read_exact(&mut tag)?;
        if &tag != b"WAVE" {
            return Err(bad("not a WAVE file"));
        }

        let mut format: Option<AudioFormat> = None;
        loop {
            file.read_exact(&mut tag)?;
            let size = file.read_u32::<LittleEndian>()? as u64;
            match &tag {
                b"fmt " => {
                    let format_tag = file.read_u16::<LittleEndian>()?;
                    let channels = file.read_u16::<LittleEndian>()?;
                    let sample_rate = file.read_u32::<LittleEndian>()?;
                    let _byte_rate = file.read_u32::<LittleEndian>()?;
                    let _block_align = file.read_u16::<LittleEndian>()?;
                    let bits = file.read_u16::<LittleEndian>()?;
                    if size > 16 {
                        file.seek(SeekFrom::Current((size - 16) as i64))?;
                    }
                    let sample_format = match (format_tag, bits) {
                        (FORMAT_PCM, 16) => SampleFormat::Int16,
                        (FORMAT_IEEE_FLOAT, 32) => SampleFormat::Float32,
                        _ => return Err(bad("unsupported sample layout")),
                    };
                    if channels == 0 || sample_rate == 0 {
                        return Err(bad("degenerate format chunk"));
                    }
                    format = Some(AudioFormat {
                        sample_rate,
                        channels,
                        sample_format,
                        interleaved: true,
                    });
                }
                b"data" => {
                    let format = format.ok_or_else(|| bad("data chunk before fmt chunk"))?;
                    return Ok((format, size));
                }
                _ => {
                    // Skip unknown chunks, honoring RIFF word padding.
                    file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
            }
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frames(&self) -> u64 {
        self.frames_total
    }

    /// Read up to `max_frames` interleaved frames; `None` at end of stream.
    pub fn read_chunk(&mut self, max_frames: usize) -> Result<Option<PcmBuffer>> {
        let remaining = self.frames_total - self.frames_read;
        if remaining == 0 {
            return Ok(None);
        }
        let frames = remaining.min(max_frames as u64) as usize;
        let samples = frames * self.format.channels as usize;

        let data = match self.format.sample_format {
            SampleFormat::Int16 => {
                let mut buf = vec![0i16; samples];
                self.file
                    .read_i16_into::<LittleEndian>(&mut buf)
                    .map_err(|e| ConversionError::io(&self.path, e))?;
                SampleData::Int16(buf)
            }
            SampleFormat::Float32 => {
                let mut buf = vec![0f32; samples];
                self.file
                    .read_f32_into::<LittleEndian>(&mut buf)
                    .map_err(|e| ConversionError::io(&self.path, e))?;
                SampleData::Float32(buf)
            }
        };
        self.frames_read += frames as u64;
        Ok(Some(PcmBuffer::new(self.format, data)))
    }
}
