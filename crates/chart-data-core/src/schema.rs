use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::ChartDataError;

const PRICE_COLUMNS: [&str; 5] = ["o", "h", "l", "c", "v"];

/// Arrow schema for exported candles. Prices and volume are stored as decimal
/// strings so nothing is lost to float conversion.
pub fn candle_schema() -> Schema {
    let mut fields = vec![Field::new(
        "t",
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )];
    fields.extend(
        PRICE_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Utf8, false)),
    );
    Schema::new(fields)
}

fn decimal_column(candles: &[Candle], field: fn(&Candle) -> Decimal) -> ArrayRef {
    let values: Vec<String> = candles.iter().map(|c| field(c).to_string()).collect();
    Arc::new(StringArray::from(
        values.iter().map(|s| s.as_str()).collect::<Vec<&str>>(),
    ))
}

pub fn candles_to_record_batch(candles: &[Candle]) -> Result<RecordBatch, ChartDataError> {
    let schema = Arc::new(candle_schema());
    let timestamps: Vec<i64> = candles.iter().map(|c| c.t).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(timestamps).with_timezone("UTC")),
        decimal_column(candles, |c| c.o),
        decimal_column(candles, |c| c.h),
        decimal_column(candles, |c| c.l),
        decimal_column(candles, |c| c.c),
        decimal_column(candles, |c| c.v),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, index: usize) -> Result<&'a StringArray, ChartDataError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            ChartDataError::InvalidData(format!("expected {} column", PRICE_COLUMNS[index - 1]))
        })
}

fn parse_decimal(column: &StringArray, row: usize, name: &str) -> Result<Decimal, ChartDataError> {
    column
        .value(row)
        .parse()
        .map_err(|e| ChartDataError::InvalidData(format!("invalid {name}: {e}")))
}

pub fn record_batch_to_candles(batch: &RecordBatch) -> Result<Vec<Candle>, ChartDataError> {
    let timestamps = batch
        .column(0)
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| ChartDataError::InvalidData("expected t column".into()))?;

    let opens = string_column(batch, 1)?;
    let highs = string_column(batch, 2)?;
    let lows = string_column(batch, 3)?;
    let closes = string_column(batch, 4)?;
    let volumes = string_column(batch, 5)?;

    let mut candles = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        candles.push(Candle {
            t: timestamps.value(i),
            o: parse_decimal(opens, i, "o")?,
            h: parse_decimal(highs, i, "h")?,
            l: parse_decimal(lows, i, "l")?,
            c: parse_decimal(closes, i, "c")?,
            v: parse_decimal(volumes, i, "v")?,
        });
    }

    Ok(candles)
}

pub fn write_parquet(path: &Path, candles: &[Candle]) -> Result<(), ChartDataError> {
    let batch = candles_to_record_batch(candles)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<Candle>, ChartDataError> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut all_candles = Vec::new();
    for batch in reader {
        all_candles.append(&mut record_batch_to_candles(&batch?)?);
    }

    Ok(all_candles)
}
