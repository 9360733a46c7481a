mod runlist;
mod staging;
