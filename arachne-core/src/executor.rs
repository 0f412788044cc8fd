//! 任务拆分执行器
//!
//! 将相互独立的工作单元扇出到工作线程并汇合结果，用于批量解析
//! 切面组等纯吞吐量优化场景。组间无顺序保证，结果按输入顺序汇合，
//! 组内的优先级排序由调用方在汇合后重建

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// 任务拆分执行器
///
/// 单个工作单元的 panic 只影响该单元的结果，不会传播
pub struct TaskExecutor {
    parallelism: usize,
}

impl TaskExecutor {
    /// 创建执行器，并行度取可用核数
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { parallelism }
    }

    /// 指定并行度
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// 顺序执行器（就地执行，不启动线程）
    pub fn sequential() -> Self {
        Self { parallelism: 1 }
    }

    /// 并行度
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// 扇出执行所有工作单元，按输入顺序返回结果
    pub fn execute_all<T, R, F>(&self, items: Vec<T>, worker: F) -> Vec<CoreResult<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let workers = self.parallelism.min(total);
        if workers <= 1 {
            return items
                .into_iter()
                .map(|item| Self::run_guarded(&worker, item))
                .collect();
        }

        let (tx, rx) = crossbeam::channel::unbounded();
        for pair in items.into_iter().enumerate() {
            // unbounded channel，send 只会在接收端全部断开时失败
            let _ = tx.send(pair);
        }
        drop(tx);

        let results: Mutex<Vec<Option<CoreResult<R>>>> =
            Mutex::new((0..total).map(|_| None).collect());

        let scope_result = crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let results = &results;
                let worker = &worker;
                scope.spawn(move |_| {
                    while let Ok((index, item)) = rx.recv() {
                        let outcome = Self::run_guarded(worker, item);
                        results.lock()[index] = Some(outcome);
                    }
                });
            }
        });

        if scope_result.is_err() {
            tracing::error!("Task executor scope terminated abnormally");
        }

        results
            .into_inner()
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(CoreError::ExecutorPanic("task result missing".to_string()))
                })
            })
            .collect()
    }

    fn run_guarded<T, R, F>(worker: &F, item: T) -> CoreResult<R>
    where
        F: Fn(T) -> R,
    {
        match catch_unwind(AssertUnwindSafe(|| worker(item))) {
            Ok(result) => Ok(result),
            Err(payload) => Err(CoreError::ExecutorPanic(panic_message(&payload))),
        }
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// 提取 panic 载荷中的消息
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_keep_input_order() {
        let executor = TaskExecutor::with_parallelism(4);

        let results = executor.execute_all(vec![3u64, 1, 2, 5, 4], |n| {
            // 故意让小的数睡得久一些，打乱完成顺序
            std::thread::sleep(std::time::Duration::from_millis(6 - n));
            n * 10
        });

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 10, 20, 50, 40]);
    }

    #[test]
    fn test_panic_affects_single_unit() {
        let executor = TaskExecutor::with_parallelism(2);

        let results = executor.execute_all(vec![1, 2, 3], |n| {
            if n == 2 {
                panic!("unit failure");
            }
            n
        });

        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(results[1], Err(CoreError::ExecutorPanic(_))));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[test]
    fn test_sequential_executor() {
        let executor = TaskExecutor::sequential();
        let results = executor.execute_all(vec!["a", "b"], |s| s.to_uppercase());
        let values: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        let executor = TaskExecutor::new();
        let results: Vec<CoreResult<u32>> = executor.execute_all(Vec::<u32>::new(), |n| n);
        assert!(results.is_empty());
    }
}
