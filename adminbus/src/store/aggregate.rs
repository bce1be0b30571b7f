//! Per-field merge rules.
//!
//! `aggregate_*` merges the same object as seen by different children into
//! the consolidated view. `accumulate_*` folds one child's totals into a
//! cluster-wide sum. The two differ on purpose: aggregation copies gauges
//! such as open connections from the last child, accumulation sums them.

use crate::stats::types::{
    AccumulatedVsSlot, AvgBucket, CacheBucket, DnsBucket, KeepAliveBucket, ProcessSlot,
    ProfileBucket, RequestBucket, ServletSlot, ThreadPoolBucket, WebModuleCacheSlot, WebModuleSlot,
};

fn sum_status_counters(dest: &mut RequestBucket, src: &RequestBucket) {
    dest.count_requests += src.count_requests;
    dest.count_bytes_received += src.count_bytes_received;
    dest.count_bytes_transmitted += src.count_bytes_transmitted;
    dest.count_2xx += src.count_2xx;
    dest.count_3xx += src.count_3xx;
    dest.count_4xx += src.count_4xx;
    dest.count_5xx += src.count_5xx;
    dest.count_other += src.count_other;
    dest.count_200 += src.count_200;
    dest.count_302 += src.count_302;
    dest.count_304 += src.count_304;
    dest.count_400 += src.count_400;
    dest.count_401 += src.count_401;
    dest.count_403 += src.count_403;
    dest.count_404 += src.count_404;
    dest.count_503 += src.count_503;
}

pub fn aggregate_request_bucket(dest: &mut RequestBucket, src: &RequestBucket) {
    sum_status_counters(dest, src);
    dest.rate_bytes_transmitted = src.rate_bytes_transmitted;
    dest.count_open_connections = src.count_open_connections;
}

pub fn aggregate_profile(dest: &mut ProfileBucket, src: &ProfileBucket) {
    dest.count_calls += src.count_calls;
    dest.count_requests += src.count_requests;
    dest.ticks_dispatch += src.ticks_dispatch;
    dest.ticks_function += src.ticks_function;
}

/// Pairs buckets by position; extra buckets on either side are ignored.
pub fn aggregate_profiles(dest: &mut [ProfileBucket], src: &[ProfileBucket]) {
    for (d, s) in dest.iter_mut().zip(src) {
        aggregate_profile(d, s);
    }
}

/// Sessions are shared between children, so session fields are copied.
pub fn aggregate_web_module(
    dest: &mut WebModuleSlot,
    dest_cache: &mut WebModuleCacheSlot,
    src: &WebModuleSlot,
    src_cache: &WebModuleCacheSlot,
) {
    dest.count_jsp = dest.count_jsp.max(src.count_jsp);
    dest.count_jsp_reload = dest.count_jsp_reload.max(src.count_jsp_reload);
    dest.count_sessions = src.count_sessions;
    dest.count_active_sessions = src.count_active_sessions;
    dest.peak_active_sessions = src.peak_active_sessions;
    dest.count_rejected_sessions = src.count_rejected_sessions;
    dest.count_expired_sessions = src.count_expired_sessions;
    dest.session_max_alive_time = src.session_max_alive_time;
    dest.session_avg_alive_time = src.session_avg_alive_time;

    dest_cache.max_entries = src_cache.max_entries;
    dest_cache.threshold = src_cache.threshold;
    dest_cache.table_size = src_cache.table_size;
    dest_cache.entry_count += src_cache.entry_count;
    dest_cache.hit_count += src_cache.hit_count;
    dest_cache.miss_count += src_cache.miss_count;
    dest_cache.removal_count += src_cache.removal_count;
    dest_cache.refresh_count += src_cache.refresh_count;
    dest_cache.overflow_count += src_cache.overflow_count;
    dest_cache.add_count += src_cache.add_count;
    dest_cache.lru_list_length = src_cache.lru_list_length;
    dest_cache.trim_count += src_cache.trim_count;
    dest_cache.segment_size = src_cache.segment_size;
    dest_cache.current_size += src_cache.current_size;
    dest_cache.max_size = src_cache.max_size;
}

pub fn aggregate_servlet(dest: &mut ServletSlot, src: &ServletSlot) {
    dest.count_request += src.count_request;
    dest.millisec_processing += src.millisec_processing;
    dest.millisec_peak_processing = dest.millisec_peak_processing.max(src.millisec_peak_processing);
    dest.count_error += src.count_error;
}

pub fn accumulate_keep_alive(sum: &mut KeepAliveBucket, delta: &KeepAliveBucket) {
    sum.count_connections += delta.count_connections;
    sum.max_connections += delta.max_connections;
    sum.count_hits += delta.count_hits;
    sum.count_flushes += delta.count_flushes;
    sum.count_timeouts += delta.count_timeouts;
    sum.seconds_timeout = delta.seconds_timeout;
    sum.count_refusals += delta.count_refusals;
}

pub fn accumulate_cache(sum: &mut CacheBucket, delta: &CacheBucket) {
    sum.flag_enabled |= delta.flag_enabled;
    sum.seconds_max_age = delta.seconds_max_age;
    sum.count_entries += delta.count_entries;
    sum.max_entries += delta.max_entries;
    sum.count_open_entries += delta.count_open_entries;
    sum.max_open_entries += delta.max_open_entries;
    sum.size_heap_cache += delta.size_heap_cache;
    sum.max_heap_cache_size += delta.max_heap_cache_size;
    sum.size_mmap_cache += delta.size_mmap_cache;
    sum.max_mmap_cache_size += delta.max_mmap_cache_size;
    sum.count_hits += delta.count_hits;
    sum.count_misses += delta.count_misses;
    sum.count_info_hits += delta.count_info_hits;
    sum.count_info_misses += delta.count_info_misses;
    sum.count_content_hits += delta.count_content_hits;
    sum.count_content_misses += delta.count_content_misses;
    sum.count_accelerator_entries += delta.count_accelerator_entries;
    sum.count_acceleratable_requests += delta.count_acceleratable_requests;
    sum.count_unacceleratable_requests += delta.count_unacceleratable_requests;
    sum.count_acceleratable_responses += delta.count_acceleratable_responses;
    sum.count_unacceleratable_responses += delta.count_unacceleratable_responses;
    sum.count_accelerator_hits += delta.count_accelerator_hits;
    sum.count_accelerator_misses += delta.count_accelerator_misses;
}

pub fn accumulate_dns(sum: &mut DnsBucket, delta: &DnsBucket) {
    sum.flag_cache_enabled |= delta.flag_cache_enabled;
    sum.flag_async_enabled |= delta.flag_async_enabled;
    sum.count_cache_entries += delta.count_cache_entries;
    sum.max_cache_entries += delta.max_cache_entries;
    sum.count_cache_hits += delta.count_cache_hits;
    sum.count_cache_misses += delta.count_cache_misses;
    sum.count_async_name_lookups += delta.count_async_name_lookups;
    sum.count_async_addr_lookups += delta.count_async_addr_lookups;
    sum.count_async_lookups_in_progress += delta.count_async_lookups_in_progress;
}

pub fn accumulate_request(sum: &mut RequestBucket, delta: &RequestBucket) {
    sum_status_counters(sum, delta);
    sum.rate_bytes_transmitted += delta.rate_bytes_transmitted;
    sum.count_open_connections += delta.count_open_connections;
}

pub fn accumulate_profile(sum: &mut ProfileBucket, delta: &ProfileBucket) {
    sum.offset_name = delta.offset_name;
    sum.offset_description = delta.offset_description;
    aggregate_profile(sum, delta);
}

pub fn accumulate_thread_pool(sum: &mut ThreadPoolBucket, delta: &ThreadPoolBucket) {
    sum.offset_name = delta.offset_name;
    sum.count_threads_idle += delta.count_threads_idle;
    sum.count_threads += delta.count_threads;
    sum.max_threads += delta.max_threads;
    sum.count_queued += delta.count_queued;
    sum.peak_queued += delta.peak_queued;
    sum.max_queued += delta.max_queued;
}

/// Sums only; the caller divides by the number of contributors.
pub fn accumulate_avg(sum: &mut AvgBucket, delta: &AvgBucket) {
    sum.one_minute_average += delta.one_minute_average;
    sum.five_minute_average += delta.five_minute_average;
    sum.fifteen_minute_average += delta.fifteen_minute_average;
}

pub fn accumulate_accumulated_vs(sum: &mut AccumulatedVsSlot, delta: &AccumulatedVsSlot) {
    accumulate_request(&mut sum.request_bucket, &delta.request_bucket);
    accumulate_profile(&mut sum.all_reqs_profile_bucket, &delta.all_reqs_profile_bucket);
    accumulate_avg(&mut sum.request_avg_bucket, &delta.request_avg_bucket);
    accumulate_avg(&mut sum.error_avg_bucket, &delta.error_avg_bucket);
    accumulate_avg(&mut sum.response_time_avg_bucket, &delta.response_time_avg_bucket);
    sum.max_response_time = sum.max_response_time.max(delta.max_response_time);
}

/// Merges per-child accumulated VS slots into one cluster slot.
///
/// Request and error rates are summed. Response time averages become the
/// mean of the per-child moving averages, which approximates but does not
/// equal the average over all requests.
pub fn merge_accumulated_vs<'a>(slots: impl IntoIterator<Item = &'a AccumulatedVsSlot>) -> AccumulatedVsSlot {
    let mut merged = AccumulatedVsSlot::default();
    let mut count = 0usize;
    for slot in slots {
        if count == 0 {
            merged = slot.clone();
        } else {
            accumulate_accumulated_vs(&mut merged, slot);
        }
        count += 1;
    }
    if count > 0 {
        let n = count as f64;
        let avg = &mut merged.response_time_avg_bucket;
        avg.one_minute_average /= n;
        avg.five_minute_average /= n;
        avg.fifteen_minute_average /= n;
    }
    merged
}

/// Cluster-wide process totals. Peak connections take the maximum, the rest
/// follows the bucket rules above.
pub fn accumulate_process(sum: &mut ProcessSlot, delta: &ProcessSlot) {
    accumulate_request(&mut sum.request_bucket, &delta.request_bucket);
    accumulate_keep_alive(&mut sum.keep_alive_bucket, &delta.keep_alive_bucket);
    accumulate_cache(&mut sum.cache_bucket, &delta.cache_bucket);
    accumulate_dns(&mut sum.dns_bucket, &delta.dns_bucket);
    sum.count_threads += delta.count_threads;
    sum.count_idle_threads += delta.count_idle_threads;
    sum.count_connections += delta.count_connections;
    sum.peak_connections = sum.peak_connections.max(delta.peak_connections);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(count: u64, open: u32) -> RequestBucket {
        RequestBucket {
            count_requests: count,
            count_200: count,
            count_open_connections: open,
            rate_bytes_transmitted: u64::from(open) * 10,
            ..Default::default()
        }
    }

    #[test]
    fn aggregation_copies_gauges_accumulation_sums_them() {
        let mut aggregated = request(10, 3);
        aggregate_request_bucket(&mut aggregated, &request(25, 9));
        assert_eq!(aggregated.count_requests, 35);
        assert_eq!(aggregated.count_200, 35);
        assert_eq!(aggregated.count_open_connections, 9);
        assert_eq!(aggregated.rate_bytes_transmitted, 90);

        let mut accumulated = request(10, 3);
        accumulate_request(&mut accumulated, &request(25, 9));
        assert_eq!(accumulated.count_requests, 35);
        assert_eq!(accumulated.count_open_connections, 12);
        assert_eq!(accumulated.rate_bytes_transmitted, 120);
    }

    #[test]
    fn process_totals_sum_counters_and_max_peaks() {
        let children = [(10, 3), (25, 9), (7, 4)].map(|(requests, peak)| ProcessSlot {
            request_bucket: request(requests, 1),
            peak_connections: peak,
            count_threads: 8,
            ..Default::default()
        });
        let mut total = ProcessSlot::default();
        for child in &children {
            accumulate_process(&mut total, child);
        }
        assert_eq!(total.request_bucket.count_requests, 42);
        assert_eq!(total.peak_connections, 9);
        assert_eq!(total.count_threads, 24);
    }

    #[test]
    fn bucket_flags_are_ored_and_timeouts_copied() {
        let mut total = ProcessSlot::default();
        let child = |enabled, timeout| ProcessSlot {
            cache_bucket: CacheBucket {
                flag_enabled: enabled,
                count_hits: 2,
                ..Default::default()
            },
            keep_alive_bucket: KeepAliveBucket {
                seconds_timeout: timeout,
                count_hits: 3,
                num_threads: 1,
                ..Default::default()
            },
            dns_bucket: DnsBucket {
                flag_async_enabled: enabled,
                ..Default::default()
            },
            ..Default::default()
        };
        accumulate_process(&mut total, &child(true, 30));
        accumulate_process(&mut total, &child(false, 15));
        assert!(total.cache_bucket.flag_enabled);
        assert!(total.dns_bucket.flag_async_enabled);
        assert_eq!(total.cache_bucket.count_hits, 4);
        assert_eq!(total.keep_alive_bucket.count_hits, 6);
        assert_eq!(total.keep_alive_bucket.seconds_timeout, 15);
        assert_eq!(total.keep_alive_bucket.num_threads, 0);
    }

    #[test]
    fn web_module_sessions_are_copied_cache_counters_summed() {
        let mut dest = WebModuleSlot {
            count_jsp: 4,
            count_sessions: 100,
            ..Default::default()
        };
        let mut dest_cache = WebModuleCacheSlot {
            hit_count: 5,
            max_entries: 10,
            ..Default::default()
        };
        let src = WebModuleSlot {
            count_jsp: 2,
            count_sessions: 120,
            ..Default::default()
        };
        let src_cache = WebModuleCacheSlot {
            hit_count: 7,
            max_entries: 20,
            ..Default::default()
        };
        aggregate_web_module(&mut dest, &mut dest_cache, &src, &src_cache);
        assert_eq!(dest.count_jsp, 4);
        assert_eq!(dest.count_sessions, 120);
        assert_eq!(dest_cache.hit_count, 12);
        assert_eq!(dest_cache.max_entries, 20);
    }

    #[test]
    fn servlet_peak_is_max() {
        let mut dest = ServletSlot {
            count_request: 3,
            millisec_peak_processing: 50,
            ..Default::default()
        };
        aggregate_servlet(
            &mut dest,
            &ServletSlot {
                count_request: 4,
                millisec_peak_processing: 20,
                ..Default::default()
            },
        );
        assert_eq!(dest.count_request, 7);
        assert_eq!(dest.millisec_peak_processing, 50);
    }

    #[test]
    fn accumulated_vs_response_time_is_mean_of_means() {
        let a = AccumulatedVsSlot {
            response_time_avg_bucket: AvgBucket {
                one_minute_average: 2.0,
                five_minute_average: 4.0,
                fifteen_minute_average: 6.0,
            },
            request_avg_bucket: AvgBucket {
                one_minute_average: 10.0,
                ..Default::default()
            },
            max_response_time: 1.5,
            ..Default::default()
        };
        let b = AccumulatedVsSlot {
            response_time_avg_bucket: AvgBucket {
                one_minute_average: 4.0,
                five_minute_average: 8.0,
                fifteen_minute_average: 12.0,
            },
            request_avg_bucket: AvgBucket {
                one_minute_average: 5.0,
                ..Default::default()
            },
            max_response_time: 0.5,
            ..Default::default()
        };
        let merged = merge_accumulated_vs([&a, &b]);
        assert_eq!(merged.response_time_avg_bucket.one_minute_average, 3.0);
        assert_eq!(merged.response_time_avg_bucket.fifteen_minute_average, 9.0);
        assert_eq!(merged.request_avg_bucket.one_minute_average, 15.0);
        assert_eq!(merged.max_response_time, 1.5);
        assert_eq!(merge_accumulated_vs([]), AccumulatedVsSlot::default());
    }
}
