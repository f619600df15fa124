//! Technical indicators over plain `f64` series (oldest first).
//!
//! Everything returns `None` when the series is too short rather than
//! padding with zeros.

use chrono::NaiveDate;
use statrs::statistics::Statistics;

use crate::data::Bar;

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

pub fn volumes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Simple moving average of the last `n` values.
pub fn sma(values: &[f64], n: usize) -> Option<f64> {
    if n == 0 || values.len() < n {
        return None;
    }
    mean(&values[values.len() - n..])
}

/// Bar-over-bar fractional change.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Sample standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sd = values.std_dev();
    sd.is_finite().then_some(sd)
}

/// Annualised volatility in percent from daily closes.
pub fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    std_dev(&pct_change(closes)).map(|sd| sd * 252f64.sqrt() * 100.0)
}

/// Percent return from `lookback` bars ago to the last bar.
pub fn return_pct(closes: &[f64], lookback: usize) -> Option<f64> {
    let last = *closes.last()?;
    let idx = closes.len().checked_sub(lookback + 1)?;
    let base = closes[idx];
    (base > 0.0).then(|| (last / base - 1.0) * 100.0)
}

/// Opening gap in percent relative to the prior close.
pub fn gap_pct(prev_close: f64, open: f64) -> Option<f64> {
    (prev_close > 0.0).then(|| (open - prev_close) / prev_close * 100.0)
}

/// RSI with a plain rolling mean of gains and losses (last value only).
pub fn rsi_simple(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes[closes.len() - period - 1..]
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();
    let gain = deltas.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss = deltas.iter().filter(|d| **d < 0.0).map(|d| -d).sum::<f64>() / period as f64;
    Some(rsi_from(gain, loss))
}

/// Wilder-smoothed RSI for every bar; the first `period` entries are `None`.
pub fn rsi_wilder(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gain = |d: f64| d.max(0.0);
    let loss = |d: f64| (-d).max(0.0);

    let p = period as f64;
    let mut avg_gain = deltas[..period].iter().copied().map(gain).sum::<f64>() / p;
    let mut avg_loss = deltas[..period].iter().copied().map(loss).sum::<f64>() / p;
    out[period] = Some(rsi_from(avg_gain, avg_loss));

    for i in period..deltas.len() {
        avg_gain = (avg_gain * (p - 1.0) + gain(deltas[i])) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss(deltas[i])) / p;
        out[i + 1] = Some(rsi_from(avg_gain, avg_loss));
    }
    out
}

/// Latest defined Wilder RSI.
pub fn rsi_wilder_last(closes: &[f64], period: usize) -> Option<f64> {
    rsi_wilder(closes, period).into_iter().flatten().last()
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Volume-weighted average of typical price.
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let volume: f64 = bars.iter().map(|b| b.volume).sum();
    if volume <= 0.0 {
        return None;
    }
    Some(bars.iter().map(|b| b.typical_price() * b.volume).sum::<f64>() / volume)
}

/// Indices of local minima: no lower value within `order` bars either side.
pub fn troughs(values: &[f64], order: usize) -> Vec<usize> {
    local_extrema(values, order, |center, other| center <= other)
}

/// Indices of local maxima.
pub fn peaks(values: &[f64], order: usize) -> Vec<usize> {
    local_extrema(values, order, |center, other| center >= other)
}

fn local_extrema(values: &[f64], order: usize, keeps: impl Fn(f64, f64) -> bool) -> Vec<usize> {
    if order == 0 || values.len() <= 2 * order {
        return Vec::new();
    }
    (order..values.len() - order)
        .filter(|&i| (1..=order).all(|j| keeps(values[i], values[i - j]) && keeps(values[i], values[i + j])))
        .collect()
}

/// Highest high over the bars.
pub fn highest_high(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.high).reduce(f64::max)
}

/// Bars whose exchange-local date is `date`.
pub fn bars_on(bars: &[Bar], date: NaiveDate) -> Vec<Bar> {
    bars.iter().filter(|b| b.date() == date).cloned().collect()
}

/// Highest minus lowest close over the last `n` values, as a percent of the last.
pub fn range_pct(closes: &[f64], n: usize) -> Option<f64> {
    if n == 0 || closes.len() < n {
        return None;
    }
    let window = &closes[closes.len() - n..];
    let hi = window.iter().copied().reduce(f64::max)?;
    let lo = window.iter().copied().reduce(f64::min)?;
    let last = *closes.last()?;
    (last > 0.0).then(|| (hi - lo) / last * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(h: f64, l: f64, c: f64, v: f64) -> Bar {
        Bar {
            ts: Utc::now(),
            open: c,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn test_sma() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(sma(&v, 2), Some(3.5));
        assert_eq!(sma(&v, 5), None);
    }

    #[test]
    fn test_return_pct() {
        let v = [100.0, 105.0, 110.0];
        assert!((return_pct(&v, 2).unwrap() - 10.0).abs() < 1e-9);
        assert!(return_pct(&v, 3).is_none());
    }

    #[test]
    fn test_gap_pct() {
        assert!((gap_pct(100.0, 95.0).unwrap() + 5.0).abs() < 1e-9);
        assert!(gap_pct(0.0, 95.0).is_none());
    }

    #[test]
    fn test_rsi_simple_all_up_is_100() {
        let v: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(rsi_simple(&v, 2), Some(100.0));
    }

    #[test]
    fn test_rsi_simple_balanced() {
        let v = [10.0, 11.0, 10.0];
        assert!((rsi_simple(&v, 2).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_wilder_shape() {
        let v: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let series = rsi_wilder(&v, 14);
        assert_eq!(series.len(), 30);
        assert!(series[13].is_none());
        assert!(series[14].is_some());
        assert!(series.iter().flatten().all(|r| (0.0..=100.0).contains(r)));
    }

    #[test]
    fn test_vwap() {
        let bars = [bar(11.0, 9.0, 10.0, 100.0), bar(21.0, 19.0, 20.0, 300.0)];
        assert!((vwap(&bars).unwrap() - 17.5).abs() < 1e-9);
        assert!(vwap(&[bar(1.0, 1.0, 1.0, 0.0)]).is_none());
    }

    #[test]
    fn test_extrema() {
        let v = [5.0, 4.0, 3.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0];
        assert_eq!(troughs(&v, 2), vec![3]);
        assert_eq!(peaks(&v, 2), vec![6]);
    }

    #[test]
    fn test_range_pct() {
        let v = [90.0, 110.0, 100.0];
        assert!((range_pct(&v, 3).unwrap() - 20.0).abs() < 1e-9);
        assert!(range_pct(&v, 4).is_none());
    }

    #[test]
    fn test_std_dev_and_volatility() {
        assert!(std_dev(&[1.0]).is_none());
        assert!((std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap() - 2.138).abs() < 1e-3);
        let flat = [100.0; 30];
        assert_eq!(annualized_volatility(&flat), Some(0.0));
    }
}
